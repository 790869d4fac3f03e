//! `netsync_client`
//!
//! Client-side machinery of the synchronization core: prediction, snapshot
//! reconciliation, and the rewind driver.

pub mod client;

pub use client::{ClientSynchronizer, FixedTicker};
