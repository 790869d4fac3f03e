//! Networking abstractions.
//!
//! The core never touches sockets: it sees the transport through the narrow
//! [`NetworkInterface`] trait (peer identity, reliable/unreliable send) and
//! frames everything it sends as RPC datagrams encoded with the typed bit
//! codec. The concrete transport lives with the host application.

use crate::controller::PeerNetworkedController;
use crate::data_buffer::{DataBuffer, Level1, Level3};
use crate::object::ObjectNetId;
use anyhow::{ensure, Result};
use bytes::Bytes;
use tracing::warn;

/// Identifies a connected peer. 0 means "nobody" (offline local peer,
/// uncontrolled object); the server is conventionally 1.
pub type PeerId = u32;

pub const NO_PEER: PeerId = 0;
pub const SERVER_PEER: PeerId = 1;

/// Identifies a sync group on the server. Group 0 always exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncGroupId(pub u32);

impl SyncGroupId {
    pub const GLOBAL: SyncGroupId = SyncGroupId(0);
}

/// Server-held authority bookkeeping for one peer.
#[derive(Debug, Clone)]
pub struct PeerAuthorityData {
    pub enabled: bool,
    pub sync_group_id: SyncGroupId,
}

impl Default for PeerAuthorityData {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_group_id: SyncGroupId::GLOBAL,
        }
    }
}

/// Per-peer record kept by the synchronizers.
///
/// Latency is stored compressed in one byte with a 4 ms quantum, clamped to
/// 0..1000 ms, so it can ride along in snapshots cheaply.
#[derive(Debug, Default)]
pub struct PeerData {
    pub authority: PeerAuthorityData,
    compressed_latency: u8,
    out_packet_loss_fraction: f32,
    latency_jitter_ms: f32,
    pub controller: Option<PeerNetworkedController>,
}

impl PeerData {
    pub fn set_latency_ms(&mut self, latency: f32) {
        self.compressed_latency = (latency.clamp(0.0, 1000.0) / 4.0).round() as u8;
    }

    pub fn latency_ms(&self) -> f32 {
        self.compressed_latency as f32 * 4.0
    }

    pub fn set_compressed_latency(&mut self, compressed: u8) {
        self.compressed_latency = compressed;
    }

    pub fn compressed_latency(&self) -> u8 {
        self.compressed_latency
    }

    pub fn set_out_packet_loss_fraction(&mut self, fraction: f32) {
        self.out_packet_loss_fraction = fraction.clamp(0.0, 1.0);
    }

    pub fn out_packet_loss_fraction(&self) -> f32 {
        self.out_packet_loss_fraction
    }

    pub fn set_latency_jitter_ms(&mut self, jitter: f32) {
        self.latency_jitter_ms = jitter;
    }

    pub fn latency_jitter_ms(&self) -> f32 {
        self.latency_jitter_ms
    }
}

/// Minimal transport contract the host supplies.
///
/// Sends are fire-and-forget; the transport may buffer asynchronously but
/// the core never awaits them. Peer connect/disconnect events and inbound
/// datagrams are pushed into the synchronizers by the host loop.
pub trait NetworkInterface {
    fn local_peer_id(&self) -> PeerId;

    fn server_peer_id(&self) -> PeerId {
        SERVER_PEER
    }

    fn is_local_peer_networked(&self) -> bool {
        self.local_peer_id() != NO_PEER
    }

    fn is_local_peer_server(&self) -> bool {
        self.local_peer_id() == self.server_peer_id()
    }

    fn fetch_connected_peers(&self) -> Vec<PeerId>;

    /// Queues a datagram toward `peer` on the reliable or unreliable channel.
    fn send(&mut self, peer: PeerId, reliable: bool, data: Bytes);

    /// Called by the server synchronizer to refresh transport statistics
    /// (latency, loss, jitter) for a peer. The default leaves them untouched.
    fn server_update_net_stats(&self, _peer: PeerId, _peer_data: &mut PeerData) {}
}

/// Registration metadata of one RPC.
#[derive(Debug, Clone)]
pub struct RpcInfo {
    pub name: &'static str,
    pub reliable: bool,
    pub call_local: bool,
}

/// Index of a registered RPC; one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcId(pub u8);

/// Table of bound RPCs, keyed by `(optional object net id, rpc index)`.
/// Registration order assigns the indices, so both ends must register the
/// same RPCs in the same order.
#[derive(Debug, Default)]
pub struct RpcTable {
    rpcs: Vec<RpcInfo>,
}

impl RpcTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, reliable: bool, call_local: bool) -> RpcId {
        debug_assert!(self.rpcs.len() < u8::MAX as usize);
        let id = RpcId(self.rpcs.len() as u8);
        self.rpcs.push(RpcInfo {
            name,
            reliable,
            call_local,
        });
        id
    }

    pub fn info(&self, id: RpcId) -> Option<&RpcInfo> {
        self.rpcs.get(id.0 as usize)
    }
}

/// Parsed RPC datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcHeader {
    pub target: Option<ObjectNetId>,
    pub rpc_id: RpcId,
}

/// Encodes an RPC datagram: a 1-bit target flag, the optional object net
/// id, the rpc index, then the argument bits verbatim.
pub fn encode_rpc(target: Option<ObjectNetId>, rpc_id: RpcId, args: &DataBuffer) -> Bytes {
    let mut db = DataBuffer::new();
    db.begin_write(0);
    match target {
        Some(net_id) => {
            db.add_bool(true);
            db.add_uint(net_id.0 as u64, Level1);
        }
        None => {
            db.add_bool(false);
        }
    }
    db.add_uint(rpc_id.0 as u64, Level3);
    db.add_bits(args.buffer().bytes(), args.total_size());
    db.dry();
    Bytes::copy_from_slice(db.buffer().bytes())
}

/// Reads the RPC header; the buffer cursor is left at the first argument
/// bit.
pub fn decode_rpc_header(db: &mut DataBuffer) -> Result<RpcHeader> {
    let has_target = db.read_bool();
    let target = if has_target {
        Some(ObjectNetId(db.read_uint(Level1) as u32))
    } else {
        None
    };
    let rpc_id = RpcId(db.read_uint(Level3) as u8);
    ensure!(!db.is_buffer_failed(), "truncated rpc datagram");
    Ok(RpcHeader { target, rpc_id })
}

// Core RPC indices. Both synchronizers register these, in this order, so
// the wire ids match on every peer.
pub const RPC_RECEIVE_INPUTS: RpcId = RpcId(0);
pub const RPC_SNAPSHOT: RpcId = RpcId(1);
pub const RPC_TICK_RATE_ADJUSTMENT: RpcId = RpcId(2);
pub const RPC_PEER_LATENCY: RpcId = RpcId(3);

/// Registers the core RPCs in their canonical order.
pub fn register_core_rpcs(table: &mut RpcTable) {
    let id = table.register("receive_inputs", false, false);
    debug_assert_eq!(id, RPC_RECEIVE_INPUTS);
    let id = table.register("snapshot", false, false);
    debug_assert_eq!(id, RPC_SNAPSHOT);
    let id = table.register("tick_rate_adjustment", false, false);
    debug_assert_eq!(id, RPC_TICK_RATE_ADJUSTMENT);
    let id = table.register("peer_latency", true, false);
    debug_assert_eq!(id, RPC_PEER_LATENCY);
}

/// Args codec for `receive_inputs`: the authority whose inputs these are,
/// plus the raw input datagram (also used verbatim when the server echoes a
/// packet to the peers simulating that authority).
pub fn encode_receive_inputs_args(authority: PeerId, packet: &[u8]) -> DataBuffer {
    let mut args = DataBuffer::new();
    args.begin_write(0);
    args.add_uint(authority as u64, Level1);
    let mut inner = DataBuffer::from_bytes(packet.to_vec());
    inner.begin_write(0);
    inner.shrink_to(0, packet.len() as u32 * 8);
    args.add_data_buffer(&inner);
    args.dry();
    args
}

pub fn decode_receive_inputs_args(db: &mut DataBuffer) -> Result<(PeerId, Vec<u8>)> {
    let authority = db.read_uint(Level1) as PeerId;
    let inner = db.read_data_buffer();
    ensure!(!db.is_buffer_failed(), "truncated receive_inputs args");
    Ok((authority, inner.buffer().bytes().to_vec()))
}

/// Args codec for the tick-rate feedback: one signed byte of distance to
/// the optimal queued-input depth.
pub fn encode_tick_rate_adjustment_args(distance: i8) -> DataBuffer {
    let mut args = DataBuffer::new();
    args.begin_write(0);
    args.add_int(distance as i64, Level3);
    args.dry();
    args
}

pub fn decode_tick_rate_adjustment_args(db: &mut DataBuffer) -> Result<i8> {
    let distance = db.read_int(Level3) as i8;
    ensure!(!db.is_buffer_failed(), "truncated tick_rate_adjustment args");
    Ok(distance)
}

/// Args codec for the latency report: `(peer, compressed latency)` pairs.
pub fn encode_peer_latency_args(latencies: &[(PeerId, u8)]) -> DataBuffer {
    let mut args = DataBuffer::new();
    args.begin_write(0);
    args.add_uint(latencies.len() as u64, Level3);
    for (peer, compressed) in latencies {
        args.add_uint(*peer as u64, Level1);
        args.add_uint(*compressed as u64, Level3);
    }
    args.dry();
    args
}

pub fn decode_peer_latency_args(db: &mut DataBuffer) -> Result<Vec<(PeerId, u8)>> {
    let count = db.read_uint(Level3);
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let peer = db.read_uint(Level1) as PeerId;
        let compressed = db.read_uint(Level3) as u8;
        out.push((peer, compressed));
    }
    ensure!(!db.is_buffer_failed(), "truncated peer_latency args");
    Ok(out)
}

/// Datagrams addressed to an object whose net id is not known yet. They are
/// retried once the object is registered client-side.
#[derive(Debug, Default)]
pub struct UndeliveredRpcs {
    pending: Vec<(ObjectNetId, PeerId, Bytes)>,
}

impl UndeliveredRpcs {
    pub fn hold(&mut self, net_id: ObjectNetId, sender: PeerId, data: Bytes) {
        warn!(net_id = net_id.0, "rpc held for a not yet known object");
        self.pending.push((net_id, sender, data));
    }

    /// Removes and returns the datagrams waiting for `net_id`, in arrival
    /// order.
    pub fn take_for(&mut self, net_id: ObjectNetId) -> Vec<(PeerId, Bytes)> {
        let mut delivered = Vec::new();
        self.pending.retain(|(id, sender, data)| {
            if *id == net_id {
                delivered.push((*sender, data.clone()));
                false
            } else {
                true
            }
        });
        delivered
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_buffer::Level2;

    #[test]
    fn rpc_roundtrip_without_target() {
        let mut args = DataBuffer::new();
        args.begin_write(0);
        args.add_uint(440, Level2);
        args.dry();

        let bytes = encode_rpc(None, RpcId(3), &args);

        let mut db = DataBuffer::from_bytes(bytes.to_vec());
        let header = decode_rpc_header(&mut db).unwrap();
        assert_eq!(header.target, None);
        assert_eq!(header.rpc_id, RpcId(3));
        assert_eq!(db.read_uint(Level2), 440);
    }

    #[test]
    fn rpc_roundtrip_with_target() {
        let mut args = DataBuffer::new();
        args.begin_write(0);
        args.add_bool(true);
        args.dry();

        let bytes = encode_rpc(Some(ObjectNetId(88)), RpcId(1), &args);

        let mut db = DataBuffer::from_bytes(bytes.to_vec());
        let header = decode_rpc_header(&mut db).unwrap();
        assert_eq!(header.target, Some(ObjectNetId(88)));
        assert_eq!(header.rpc_id, RpcId(1));
        assert_eq!(db.read_bool(), true);
    }

    #[test]
    fn truncated_rpc_is_an_error() {
        let mut db = DataBuffer::from_bytes(vec![]);
        assert!(decode_rpc_header(&mut db).is_err());
    }

    #[test]
    fn undelivered_rpcs_are_returned_in_order() {
        let mut pending = UndeliveredRpcs::default();
        pending.hold(ObjectNetId(5), 2, Bytes::from_static(b"a"));
        pending.hold(ObjectNetId(9), 2, Bytes::from_static(b"b"));
        pending.hold(ObjectNetId(5), 3, Bytes::from_static(b"c"));

        let for_five = pending.take_for(ObjectNetId(5));
        assert_eq!(for_five.len(), 2);
        assert_eq!(for_five[0], (2, Bytes::from_static(b"a")));
        assert_eq!(for_five[1], (3, Bytes::from_static(b"c")));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn latency_compression_quantum() {
        let mut peer = PeerData::default();
        peer.set_latency_ms(130.0);
        assert_eq!(peer.compressed_latency(), 33); // 130 / 4 rounded
        assert_eq!(peer.latency_ms(), 132.0);

        peer.set_latency_ms(5000.0);
        assert_eq!(peer.latency_ms(), 1000.0);
    }
}
