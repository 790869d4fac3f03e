//! `netsync_server`
//!
//! Server-side machinery of the synchronization core: sync groups and the
//! authoritative [`server::ServerSynchronizer`].

pub mod server;
pub mod sync_group;

pub use server::ServerSynchronizer;
pub use sync_group::{SimulatedObjectInfo, SyncGroup, TrickledObjectInfo, VarChange};
