//! `netsync_shared`
//!
//! Shared synchronization core used by both client and server.
//!
//! Design goals:
//! - Deterministic: byte-exact encoding and platform-stable math.
//! - Single-threaded and synchronous; the host drives the fixed step.
//! - Traits at the seams (transport, scene host) for dependency injection.
//! - No `unsafe`.

pub mod bit_array;
pub mod config;
pub mod controller;
pub mod data_buffer;
pub mod event;
pub mod frame;
pub mod math;
pub mod net;
pub mod object;
pub mod snapshot;
pub mod stats;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::bit_array::BitArray;
    pub use crate::config::SyncConfig;
    pub use crate::controller::{
        ControllerCtx, ControllerRole, PeerNetworkedController, INPUT_METADATA_BITS,
    };
    pub use crate::data_buffer::{CompressionLevel, DataBuffer};
    pub use crate::frame::{FrameIndex, FrameInput};
    pub use crate::net::{NetworkInterface, PeerData, PeerId, SyncGroupId, NO_PEER, SERVER_PEER};
    pub use crate::object::{
        ObjectLocalId, ObjectNetId, ObjectRegistry, SceneHost, VarData, VarFlags,
    };
    pub use crate::snapshot::{NameAndVar, Snapshot, SnapshotComparison};
}
