//! Authoritative server synchronizer.
//!
//! Owns the peer registry, assigns object net ids, drives the per-peer
//! controllers one fixed step at a time, tracks variable changes, and
//! broadcasts per-group snapshots plus the tick-rate and latency feedback.
//!
//! Determinism notes:
//! - Simulation advances only inside `process`, in peer-id order.
//! - Nothing here reads a wall clock; timestamps come in with the packets.

use crate::sync_group::{SimulatedObjectInfo, SyncGroup, TrickledObjectInfo};
use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use netsync_shared::config::SyncConfig;
use netsync_shared::controller::{ControllerCtx, PeerNetworkedController};
use netsync_shared::data_buffer::DataBuffer;
use netsync_shared::frame::FrameIndex;
use netsync_shared::net::{
    decode_receive_inputs_args, decode_rpc_header, encode_peer_latency_args, encode_rpc,
    encode_tick_rate_adjustment_args, register_core_rpcs, NetworkInterface, PeerData, PeerId,
    RpcTable, SyncGroupId, RPC_PEER_LATENCY, RPC_RECEIVE_INPUTS, RPC_SNAPSHOT,
    RPC_TICK_RATE_ADJUSTMENT, SERVER_PEER,
};
use netsync_shared::object::{ObjectLocalId, ObjectNetId, ObjectRegistry, SceneHost, VarData, VarFlags};
use netsync_shared::snapshot::{NameAndVar, Snapshot};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Relays a listener/simulating relation change to the authority's
/// controller.
fn listener_notify(
    peers: &mut BTreeMap<PeerId, PeerData>,
) -> impl FnMut(PeerId, PeerId, bool) + '_ {
    move |authority, listener, simulating| {
        if let Some(controller) = peers
            .get_mut(&authority)
            .and_then(|peer_data| peer_data.controller.as_mut())
        {
            controller.server_set_peer_simulating_this_controller(listener, simulating);
        }
    }
}

pub struct ServerSynchronizer {
    config: SyncConfig,
    registry: ObjectRegistry,
    peers: BTreeMap<PeerId, PeerData>,
    groups: Vec<SyncGroup>,
    frame_index: FrameIndex,
    next_net_id: u32,
    rpc_table: RpcTable,
    feedback_timer_ms: u32,
}

impl ServerSynchronizer {
    pub fn new(config: SyncConfig) -> Self {
        let mut rpc_table = RpcTable::new();
        register_core_rpcs(&mut rpc_table);
        Self {
            config,
            registry: ObjectRegistry::new(),
            peers: BTreeMap::new(),
            // The global group always exists.
            groups: vec![SyncGroup::default()],
            frame_index: FrameIndex(0),
            next_net_id: 0,
            rpc_table,
            feedback_timer_ms: 0,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ObjectRegistry {
        &mut self.registry
    }

    pub fn frame_index(&self) -> FrameIndex {
        self.frame_index
    }

    pub fn controller(&self, peer: PeerId) -> Option<&PeerNetworkedController> {
        self.peers.get(&peer)?.controller.as_ref()
    }

    pub fn controller_mut(&mut self, peer: PeerId) -> Option<&mut PeerNetworkedController> {
        self.peers.get_mut(&peer)?.controller.as_mut()
    }

    pub fn peer_data(&self, peer: PeerId) -> Option<&PeerData> {
        self.peers.get(&peer)
    }

    pub fn sync_group(&self, group_id: SyncGroupId) -> Option<&SyncGroup> {
        self.groups.get(group_id.0 as usize)
    }

    // ------------------------------------------------------------ lifecycle

    /// Creates the controller for a connecting peer and subscribes it to
    /// the global group.
    pub fn on_peer_connected(&mut self, peer: PeerId) {
        if self.peers.contains_key(&peer) {
            debug_assert!(false, "peer connected twice");
            warn!(peer, "peer connected twice, ignoring");
            return;
        }
        info!(peer, "peer connected");

        let mut peer_data = PeerData::default();
        let mut controller = PeerNetworkedController::new(peer);
        controller.assign_role(SERVER_PEER, true, &self.config);
        peer_data.controller = Some(controller);
        self.peers.insert(peer, peer_data);

        let mut notify = listener_notify(&mut self.peers);
        self.groups[SyncGroupId::GLOBAL.0 as usize].add_listening_peer(peer, &mut notify);
    }

    /// Destroys the controller and purges the peer from every group.
    pub fn on_peer_disconnected(&mut self, peer: PeerId) {
        info!(peer, "peer disconnected");
        self.peers.remove(&peer);
        for group in &mut self.groups {
            let mut notify = listener_notify(&mut self.peers);
            group.remove_listening_peer(peer, &mut notify);
        }
    }

    // -------------------------------------------------------------- objects

    /// Registers an object, assigns its net id (never reused), and adds it
    /// to the global group as simulated.
    pub fn register_object(
        &mut self,
        name: impl Into<String>,
        controlled_by_peer: PeerId,
        vars: Vec<(String, VarData, VarFlags)>,
    ) -> (ObjectLocalId, ObjectNetId) {
        let local_id = self.registry.register(name, controlled_by_peer, vars);
        let net_id = ObjectNetId(self.next_net_id);
        self.next_net_id += 1;
        self.registry.set_net_id(local_id, net_id);

        let mut notify = listener_notify(&mut self.peers);
        self.groups[SyncGroupId::GLOBAL.0 as usize].add_sync_object(
            &self.registry,
            local_id,
            true,
            &mut notify,
        );
        (local_id, net_id)
    }

    pub fn unregister_object(&mut self, local_id: ObjectLocalId) {
        for group in &mut self.groups {
            let mut notify = listener_notify(&mut self.peers);
            group.remove_sync_object(&self.registry, local_id, &mut notify);
        }
        self.registry.unregister(local_id);
    }

    /// Propagates an authority change to every group's peer bookkeeping.
    pub fn set_object_controlled_by(&mut self, local_id: ObjectLocalId, peer: PeerId) {
        let previous = match self.registry.get_mut(local_id) {
            Some(object) => {
                let previous = object.controlled_by_peer;
                object.controlled_by_peer = peer;
                previous
            }
            None => return,
        };
        for group in &mut self.groups {
            let mut notify = listener_notify(&mut self.peers);
            group.notify_controller_changed(&self.registry, local_id, previous, &mut notify);
        }
    }

    // --------------------------------------------------------------- groups

    pub fn create_sync_group(&mut self) -> SyncGroupId {
        self.groups.push(SyncGroup::default());
        SyncGroupId(self.groups.len() as u32 - 1)
    }

    pub fn sync_group_add_object(
        &mut self,
        group_id: SyncGroupId,
        local_id: ObjectLocalId,
        simulated: bool,
    ) {
        let Some(group) = self.groups.get_mut(group_id.0 as usize) else {
            warn!(group = group_id.0, "unknown sync group");
            return;
        };
        let mut notify = listener_notify(&mut self.peers);
        group.add_sync_object(&self.registry, local_id, simulated, &mut notify);
    }

    pub fn sync_group_remove_object(&mut self, group_id: SyncGroupId, local_id: ObjectLocalId) {
        let Some(group) = self.groups.get_mut(group_id.0 as usize) else {
            warn!(group = group_id.0, "unknown sync group");
            return;
        };
        let mut notify = listener_notify(&mut self.peers);
        group.remove_sync_object(&self.registry, local_id, &mut notify);
    }

    pub fn sync_group_replace_objects(
        &mut self,
        group_id: SyncGroupId,
        simulated: Vec<SimulatedObjectInfo>,
        trickled: Vec<TrickledObjectInfo>,
    ) {
        let Some(group) = self.groups.get_mut(group_id.0 as usize) else {
            warn!(group = group_id.0, "unknown sync group");
            return;
        };
        let mut notify = listener_notify(&mut self.peers);
        group.replace_objects(&self.registry, simulated, trickled, &mut notify);
    }

    /// Moves a peer's subscription to another group.
    pub fn sync_group_move_peer_to(&mut self, group_id: SyncGroupId, peer: PeerId) {
        if group_id.0 as usize >= self.groups.len() {
            warn!(group = group_id.0, "unknown sync group");
            return;
        }
        let previous = match self.peers.get_mut(&peer) {
            Some(peer_data) => {
                let previous = peer_data.authority.sync_group_id;
                peer_data.authority.sync_group_id = group_id;
                previous
            }
            None => {
                warn!(peer, "unknown peer");
                return;
            }
        };
        if previous == group_id {
            return;
        }
        if let Some(group) = self.groups.get_mut(previous.0 as usize) {
            let mut notify = listener_notify(&mut self.peers);
            group.remove_listening_peer(peer, &mut notify);
        }
        let group = &mut self.groups[group_id.0 as usize];
        let mut notify = listener_notify(&mut self.peers);
        group.add_listening_peer(peer, &mut notify);
    }

    // -------------------------------------------------------------- process

    /// One fixed step: consume inputs, detect variable changes, emit the
    /// periodic feedback, then broadcast group snapshots.
    pub fn process(
        &mut self,
        delta: f32,
        host: &mut dyn SceneHost,
        net: &mut dyn NetworkInterface,
    ) {
        let config = self.config.clone();
        self.frame_index += 1;

        // 1. Controllers consume inputs and advance the simulation.
        let peer_ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer in peer_ids {
            let Some(peer_data) = self.peers.get_mut(&peer) else {
                continue;
            };
            let Some(controller) = peer_data.controller.as_mut() else {
                continue;
            };
            if !controller.can_simulate(&self.registry) {
                continue;
            }
            let mut ctx = ControllerCtx {
                config: &config,
                host: &mut *host,
                registry: &mut self.registry,
            };
            controller.process(delta, &mut ctx);
        }

        // 2. Change detection against the last notified values.
        let mut changed: Vec<(ObjectLocalId, String)> = Vec::new();
        for object in self.registry.iter_mut() {
            let local_id = object.local_id;
            for var in &mut object.vars {
                let Some(value) = host.get_var(local_id, &var.name) else {
                    continue;
                };
                if value != var.last_value {
                    var.last_value = value;
                    var.changed = true;
                    changed.push((local_id, var.name.clone()));
                }
            }
        }
        for (local_id, var_name) in changed {
            for group in &mut self.groups {
                group.notify_variable_changed(local_id, &var_name);
            }
        }

        // 3. Periodic per-peer feedback: tick-rate distance and latency.
        self.feedback_timer_ms += (delta * 1000.0) as u32;
        if self.feedback_timer_ms >= config.tick_speedup_notification_delay_ms {
            self.feedback_timer_ms = 0;
            self.send_peer_feedback(&config, net);
        }

        // 4. Snapshot broadcast, one per group.
        for group_index in 0..self.groups.len() {
            let group = &mut self.groups[group_index];
            if group.listening_peers().is_empty() {
                group.mark_changes_as_notified();
                continue;
            }
            let base_snapshot = build_group_snapshot(
                group,
                &self.registry,
                &self.peers,
                &*host,
                self.frame_index,
                config.trickled_objects_per_frame as usize,
            );

            // Each listener compares against the frame of ITS OWN input
            // consumed this tick, so the snapshot id is per recipient.
            for listener in group.listening_peers() {
                let mut snapshot = base_snapshot.clone();
                snapshot.input_id = self
                    .peers
                    .get(listener)
                    .and_then(|peer_data| peer_data.controller.as_ref())
                    .map(|controller| controller.current_frame_index())
                    .unwrap_or(FrameIndex::NONE);

                let mut args = DataBuffer::new();
                args.begin_write(0);
                snapshot.encode(&mut args);
                args.dry();
                net.send(*listener, false, encode_rpc(None, RPC_SNAPSHOT, &args));
            }
            group.mark_changes_as_notified();
        }
    }

    fn send_peer_feedback(&mut self, config: &SyncConfig, net: &mut dyn NetworkInterface) {
        let mut latencies: Vec<(PeerId, u8)> = Vec::new();
        for (peer, peer_data) in self.peers.iter_mut() {
            net.server_update_net_stats(*peer, peer_data);
            latencies.push((*peer, peer_data.compressed_latency()));

            let Some(distance) = peer_data
                .controller
                .as_ref()
                .and_then(|c| c.server_controller())
                .map(|c| c.compute_client_tick_rate_distance_to_optimal(config))
            else {
                continue;
            };
            if *peer == SERVER_PEER {
                continue;
            }
            let args = encode_tick_rate_adjustment_args(distance);
            net.send(*peer, false, encode_rpc(None, RPC_TICK_RATE_ADJUSTMENT, &args));
        }

        for group in &mut self.groups {
            for (peer, _) in &latencies {
                group.notify_peer_has_newly_calculated_latency(*peer);
            }
        }
        for group in &self.groups {
            let entries: Vec<(PeerId, u8)> = group
                .peers_with_newly_calculated_latency()
                .iter()
                .filter_map(|peer| {
                    latencies
                        .iter()
                        .find(|(p, _)| p == peer)
                        .map(|(p, l)| (*p, *l))
                })
                .collect();
            if entries.is_empty() {
                continue;
            }
            let args = encode_peer_latency_args(&entries);
            let bytes = encode_rpc(None, RPC_PEER_LATENCY, &args);
            for listener in group.listening_peers() {
                net.send(*listener, true, bytes.clone());
            }
        }
    }

    // ------------------------------------------------------------------ rpc

    /// Entry point for every datagram the transport delivers to the server.
    pub fn rpc_receive(
        &mut self,
        sender: PeerId,
        bytes: Bytes,
        now_ms: u32,
        host: &mut dyn SceneHost,
        net: &mut dyn NetworkInterface,
    ) -> Result<()> {
        let mut db = DataBuffer::from_bytes(bytes.to_vec());
        let header = decode_rpc_header(&mut db)?;
        if header.target.is_some() {
            bail!("object-targeted rpc on the server core");
        }
        ensure!(
            self.rpc_table.info(header.rpc_id).is_some(),
            "unknown rpc index {}",
            header.rpc_id.0
        );

        match header.rpc_id {
            RPC_RECEIVE_INPUTS => {
                let (authority, packet) =
                    decode_receive_inputs_args(&mut db).context("receive_inputs args")?;
                ensure!(
                    authority == sender,
                    "peer {sender} tried to submit inputs for {authority}"
                );

                let config = self.config.clone();
                let Some(controller) = self
                    .peers
                    .get_mut(&sender)
                    .and_then(|peer_data| peer_data.controller.as_mut())
                else {
                    bail!("inputs from an unknown peer {sender}");
                };
                let mut ctx = ControllerCtx {
                    config: &config,
                    host: &mut *host,
                    registry: &mut self.registry,
                };
                if !controller.receive_inputs(&packet, now_ms, &mut ctx) {
                    bail!("malformed input packet from peer {sender}");
                }

                // Ping-pong the very same bytes to every peer whose doll
                // replays this controller.
                let echo_to: Vec<PeerId> = controller
                    .server_controller()
                    .map(|c| {
                        c.peers_simulating_this_controller
                            .iter()
                            .copied()
                            .filter(|p| *p != authority && *p != SERVER_PEER)
                            .collect()
                    })
                    .unwrap_or_default();
                for peer in echo_to {
                    net.send(peer, true, bytes.clone());
                }
                Ok(())
            }
            other => {
                debug!(rpc = other.0, sender, "rpc not handled by the server");
                Ok(())
            }
        }
    }
}

/// Composes one group's snapshot: every simulated object's changed (or, for
/// unknown entries, full) variable set, the top trickled objects by
/// priority, and the consumed input frame of every networked peer.
fn build_group_snapshot(
    group: &mut SyncGroup,
    registry: &ObjectRegistry,
    peers: &BTreeMap<PeerId, PeerData>,
    host: &dyn SceneHost,
    frame_index: FrameIndex,
    trickled_per_frame: usize,
) -> Snapshot {
    let mut snapshot = Snapshot::new(frame_index);

    for peer in group.networked_peers() {
        let frame = peers
            .get(peer)
            .and_then(|peer_data| peer_data.controller.as_ref())
            .map(|controller| controller.current_frame_index())
            .unwrap_or(FrameIndex::NONE);
        snapshot.peers_frames_index.insert(*peer, frame);
    }

    for info in group.simulated() {
        let Some(object) = registry.get(info.local_id) else {
            continue;
        };
        if object.net_id.is_none() {
            continue;
        }
        snapshot.simulated_objects.push(object.net_id);

        let vars: Vec<NameAndVar> = object
            .vars
            .iter()
            .filter(|descriptor| {
                info.change.unknown
                    || info.change.vars.iter().any(|v| *v == descriptor.name)
                    || info.change.unknown_vars.iter().any(|v| *v == descriptor.name)
            })
            .filter_map(|descriptor| {
                host.get_var(object.local_id, &descriptor.name)
                    .map(|value| NameAndVar {
                        name: descriptor.name.clone(),
                        value,
                    })
            })
            .collect();
        // The entry must exist even when empty: receivers key on it.
        snapshot.set_object_vars(object.net_id, vars);
    }

    group.advance_trickled_priorities();
    group.sort_trickled_by_update_priority();
    let mut sent = 0usize;
    for info in group.trickled().iter().take(trickled_per_frame) {
        let Some(object) = registry.get(info.local_id) else {
            continue;
        };
        if object.net_id.is_none() {
            continue;
        }
        let vars: Vec<NameAndVar> = object
            .vars
            .iter()
            .filter_map(|descriptor| {
                host.get_var(object.local_id, &descriptor.name)
                    .map(|value| NameAndVar {
                        name: descriptor.name.clone(),
                        value,
                    })
            })
            .collect();
        snapshot.set_object_vars(object.net_id, vars);
        sent += 1;
    }
    group.mark_trickled_sent(sent);

    snapshot
}
