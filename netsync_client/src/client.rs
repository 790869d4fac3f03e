//! Client synchronizer.
//!
//! The client maintains:
//! - The local player controller (prediction) and one doll controller per
//!   remote authority.
//! - A history of its own per-frame snapshots and of the authoritative
//!   snapshots the server confirms.
//! - The compare/rewind loop: on divergence the world is restored from the
//!   server snapshot and re-simulated forward through the retained inputs.
//! - A fixed-step accumulator that speeds up or slows down by one frame per
//!   unit of the server's tick-rate feedback.

use anyhow::{Context, Result};
use bytes::Bytes;
use netsync_shared::config::SyncConfig;
use netsync_shared::controller::{ControllerCtx, PeerNetworkedController};
use netsync_shared::data_buffer::DataBuffer;
use netsync_shared::event::Event;
use netsync_shared::frame::FrameIndex;
use netsync_shared::net::{
    decode_peer_latency_args, decode_receive_inputs_args, decode_rpc_header,
    decode_tick_rate_adjustment_args, encode_receive_inputs_args, encode_rpc, register_core_rpcs,
    NetworkInterface, PeerId, RpcTable, UndeliveredRpcs, RPC_PEER_LATENCY, RPC_RECEIVE_INPUTS,
    RPC_SNAPSHOT, RPC_TICK_RATE_ADJUSTMENT, SERVER_PEER,
};
use netsync_shared::object::{
    ObjectLocalId, ObjectNetId, ObjectRegistry, SceneHost, VarData, VarFlags,
};
use netsync_shared::snapshot::{Snapshot, SnapshotComparison};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Fixed-step accumulator with a frame credit fed by the server feedback.
#[derive(Debug, Default)]
pub struct FixedTicker {
    time_bank: f32,
    /// Positive: produce this many extra frames; negative: swallow as many.
    pending_frame_adjustment: i32,
}

impl FixedTicker {
    /// Folds real elapsed time into whole fixed frames, spending at most
    /// one unit of the adjustment credit per call.
    pub fn accumulate(&mut self, delta: f32, fixed_frame_delta: f32) -> u32 {
        self.time_bank += delta;
        let mut frames = (self.time_bank / fixed_frame_delta).floor() as u32;
        self.time_bank -= frames as f32 * fixed_frame_delta;

        if self.pending_frame_adjustment > 0 {
            frames += 1;
            self.pending_frame_adjustment -= 1;
        } else if self.pending_frame_adjustment < 0 && frames > 0 {
            frames -= 1;
            self.pending_frame_adjustment += 1;
        }
        frames
    }

    /// Feeds the signed distance received from the server.
    pub fn adjust(&mut self, distance: i8) {
        self.pending_frame_adjustment = distance as i32;
    }

    pub fn pending_adjustment(&self) -> i32 {
        self.pending_frame_adjustment
    }
}

pub struct ClientSynchronizer {
    config: SyncConfig,
    registry: ObjectRegistry,
    local_peer: PeerId,
    controllers: BTreeMap<PeerId, PeerNetworkedController>,
    /// Own per-frame records, sorted by the player input id.
    client_snapshots: Vec<Snapshot>,
    /// Confirmed server records, merged cumulatively, sorted by input id.
    server_snapshots: Vec<Snapshot>,
    /// Accumulated latest-known server state partial snapshots merge into.
    last_server_state: Snapshot,
    last_checked_frame: FrameIndex,
    rpc_table: RpcTable,
    undelivered_rpcs: UndeliveredRpcs,
    peer_latencies: BTreeMap<PeerId, u8>,
    ticker: FixedTicker,

    pub event_received_server_snapshot: Event<Snapshot>,
    pub event_snapshot_update_finished: Event<Snapshot>,
    /// `(frame, desync_detected)`
    pub event_state_validated: Event<(FrameIndex, bool)>,
    /// `(frame, rewinding_index, rewinding_frame_count)`
    pub event_rewind_frame_begin: Event<(FrameIndex, usize, usize)>,
    /// `(applied_snapshot, frame_count_to_rewind)`
    pub event_snapshot_applied: Event<(Snapshot, u32)>,
    /// `(sender, datagram)` for application-level object RPCs.
    pub event_object_rpc_received: Event<(PeerId, Bytes)>,
}

impl ClientSynchronizer {
    pub fn new(config: SyncConfig, local_peer: PeerId) -> Self {
        let mut rpc_table = RpcTable::new();
        register_core_rpcs(&mut rpc_table);

        let mut controllers = BTreeMap::new();
        let mut player = PeerNetworkedController::new(local_peer);
        player.assign_role(local_peer, false, &config);
        controllers.insert(local_peer, player);

        Self {
            config,
            registry: ObjectRegistry::new(),
            local_peer,
            controllers,
            client_snapshots: Vec::new(),
            server_snapshots: Vec::new(),
            last_server_state: Snapshot::default(),
            last_checked_frame: FrameIndex::NONE,
            rpc_table,
            undelivered_rpcs: UndeliveredRpcs::default(),
            peer_latencies: BTreeMap::new(),
            ticker: FixedTicker::default(),
            event_received_server_snapshot: Event::new(),
            event_snapshot_update_finished: Event::new(),
            event_state_validated: Event::new(),
            event_rewind_frame_begin: Event::new(),
            event_snapshot_applied: Event::new(),
            event_object_rpc_received: Event::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn controller(&self, peer: PeerId) -> Option<&PeerNetworkedController> {
        self.controllers.get(&peer)
    }

    pub fn controller_mut(&mut self, peer: PeerId) -> Option<&mut PeerNetworkedController> {
        self.controllers.get_mut(&peer)
    }

    pub fn player_controller(&self) -> &PeerNetworkedController {
        self.controllers
            .get(&self.local_peer)
            .expect("the player controller exists from construction")
    }

    pub fn last_checked_frame(&self) -> FrameIndex {
        self.last_checked_frame
    }

    pub fn peer_latency_ms(&self, peer: PeerId) -> Option<f32> {
        self.peer_latencies.get(&peer).map(|c| *c as f32 * 4.0)
    }

    pub fn ticker(&self) -> &FixedTicker {
        &self.ticker
    }

    /// Registers an object the server spawned, under the server-assigned
    /// net id. A controller is created lazily for a new remote authority,
    /// and RPCs held for this object are delivered.
    pub fn register_object(
        &mut self,
        name: impl Into<String>,
        controlled_by_peer: PeerId,
        vars: Vec<(String, VarData, VarFlags)>,
        net_id: ObjectNetId,
    ) -> ObjectLocalId {
        let local_id = self.registry.register(name, controlled_by_peer, vars);
        self.registry.set_net_id(local_id, net_id);

        if controlled_by_peer != 0 && !self.controllers.contains_key(&controlled_by_peer) {
            let mut controller = PeerNetworkedController::new(controlled_by_peer);
            controller.assign_role(self.local_peer, false, &self.config);
            self.controllers.insert(controlled_by_peer, controller);
        }

        for (sender, bytes) in self.undelivered_rpcs.take_for(net_id) {
            self.event_object_rpc_received.broadcast(&(sender, bytes));
        }
        local_id
    }

    pub fn unregister_object(&mut self, local_id: ObjectLocalId) {
        self.registry.unregister(local_id);
    }

    // -------------------------------------------------------------- process

    /// Folds wall time into fixed frames and runs them.
    pub fn process(&mut self, delta: f32, host: &mut dyn SceneHost, net: &mut dyn NetworkInterface) {
        let frames = self.ticker.accumulate(delta, self.config.fixed_frame_delta);
        for _ in 0..frames {
            self.process_tick(host, net);
        }
    }

    /// Runs exactly one fixed frame, then reconciles against the latest
    /// confirmed server state.
    pub fn process_tick(&mut self, host: &mut dyn SceneHost, net: &mut dyn NetworkInterface) {
        let delta = self.config.fixed_frame_delta;
        self.advance_controllers(delta, host, net);
        self.record_client_snapshot(host);
        self.reconcile(host);
    }

    fn advance_controllers(
        &mut self,
        delta: f32,
        host: &mut dyn SceneHost,
        net: &mut dyn NetworkInterface,
    ) {
        let config = self.config.clone();
        let last_checked = self.last_checked_frame;

        // The player first: its frame index keys this frame's snapshot.
        if let Some(controller) = self.controllers.get_mut(&self.local_peer) {
            if let Some(player) = controller.player_controller_mut() {
                player.notify_frame_checked(last_checked);
            }
            if controller.can_simulate(&self.registry) || controller.is_nonet_controller() {
                let mut ctx = ControllerCtx {
                    config: &config,
                    host: &mut *host,
                    registry: &mut self.registry,
                };
                let outcome = controller.process(delta, &mut ctx);
                if let Some(packet) = outcome.input_packet {
                    let args = encode_receive_inputs_args(self.local_peer, &packet);
                    net.send(SERVER_PEER, false, encode_rpc(None, RPC_RECEIVE_INPUTS, &args));
                }
            }
        }

        let doll_peers: Vec<PeerId> = self
            .controllers
            .keys()
            .copied()
            .filter(|p| *p != self.local_peer)
            .collect();
        for peer in doll_peers {
            let Some(controller) = self.controllers.get_mut(&peer) else {
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
    }

    /// Records what the world looks like after this frame, keyed by the
    /// player input that produced it.
    fn record_client_snapshot(&mut self, host: &mut dyn SceneHost) {
        let input_id = self
            .controllers
            .get(&self.local_peer)
            .map(|c| c.current_frame_index())
            .unwrap_or(FrameIndex::NONE);

        let mut snapshot = Snapshot::capture(input_id, &self.registry, host);
        for (peer, controller) in &self.controllers {
            snapshot
                .peers_frames_index
                .insert(*peer, controller.current_frame_index());
        }

        self.store_client_snapshot(snapshot.clone());

        for (peer, controller) in self.controllers.iter_mut() {
            if let Some(doll) = controller.doll_controller_mut() {
                doll.on_snapshot_update_finished(*peer, &snapshot, &self.registry);
            }
        }
        self.event_snapshot_update_finished.broadcast(&snapshot);
    }

    fn store_client_snapshot(&mut self, snapshot: Snapshot) {
        if snapshot.input_id.is_none() {
            return;
        }
        match self
            .client_snapshots
            .iter()
            .position(|s| s.input_id >= snapshot.input_id)
        {
            Some(i) if self.client_snapshots[i].input_id == snapshot.input_id => {
                self.client_snapshots[i] = snapshot;
            }
            Some(i) => self.client_snapshots.insert(i, snapshot),
            None => self.client_snapshots.push(snapshot),
        }
    }

    // -------------------------------------------------------- reconciliation

    /// Compares the newest matching (server, client) snapshot pair and
    /// rewinds when they diverge.
    fn reconcile(&mut self, host: &mut dyn SceneHost) {
        let Some((server_snapshot, client_index)) = self.find_checkable_pair() else {
            return;
        };
        let checked_frame = server_snapshot.input_id;
        let config = self.config.clone();

        // Doll-controlled objects run on their own timeline: they are
        // excluded from the global compare and judged by their controllers.
        let doll_peers: Vec<PeerId> = self
            .controllers
            .iter()
            .filter(|(_, c)| c.is_doll_controller())
            .map(|(peer, _)| *peer)
            .collect();
        let mut comparable = server_snapshot.clone();
        comparable.simulated_objects.retain(|net_id| {
            self.registry
                .get_by_net_id(*net_id)
                .map(|object| !doll_peers.contains(&object.controlled_by_peer))
                .unwrap_or(true)
        });

        let mut differences: Vec<String> = Vec::new();
        let mut no_rewind_recover: Option<Snapshot> = None;
        let mut desync = match Snapshot::compare(
            &comparable,
            &self.client_snapshots[client_index],
            &self.registry,
            Some(&mut differences),
        ) {
            SnapshotComparison::Equal => false,
            SnapshotComparison::NoRewindRecover(recover) => {
                no_rewind_recover = Some(recover);
                false
            }
            SnapshotComparison::RewindRequired => true,
        };

        let frame_count_to_rewind = self
            .controllers
            .get(&self.local_peer)
            .and_then(|c| c.player_controller())
            .map(|p| p.count_frames_after(checked_frame) as u32)
            .unwrap_or(0);

        // Dolls run a parallel timeline; each gets its own verdict.
        for (_, controller) in self.controllers.iter_mut() {
            if let Some(doll) = controller.doll_controller_mut() {
                if !doll.fetch_recovery_info(
                    frame_count_to_rewind,
                    &config,
                    &self.registry,
                    &mut no_rewind_recover,
                    None,
                ) {
                    desync = true;
                }
            }
        }

        if desync {
            for line in &differences {
                debug!(frame = %checked_frame, "{line}");
            }
            info!(frame = %checked_frame, frames_to_rewind = frame_count_to_rewind, "desync detected, rewinding");
            self.rewind(server_snapshot, frame_count_to_rewind, host);
        } else if let Some(recover) = no_rewind_recover {
            // Only soft variables diverged: overwrite them in place.
            recover.apply(&mut self.registry, host);
        }

        self.last_checked_frame = checked_frame;
        self.event_state_validated.broadcast(&(checked_frame, desync));
        for (_, controller) in self.controllers.iter_mut() {
            if let Some(player) = controller.player_controller_mut() {
                player.on_state_validated(checked_frame, desync);
            } else if let Some(doll) = controller.doll_controller_mut() {
                doll.on_state_validated(checked_frame, desync);
            }
        }

        // The tail is no longer needed once acknowledged.
        self.client_snapshots.retain(|s| s.input_id > checked_frame);
        self.server_snapshots.retain(|s| s.input_id > checked_frame);
    }

    /// Newest server snapshot that has a client record at the same frame.
    fn find_checkable_pair(&self) -> Option<(Snapshot, usize)> {
        for server_snapshot in self.server_snapshots.iter().rev() {
            if server_snapshot.input_id.is_none() {
                continue;
            }
            if let Some(client_index) = self
                .client_snapshots
                .iter()
                .position(|s| s.input_id == server_snapshot.input_id)
            {
                return Some((server_snapshot.clone(), client_index));
            }
        }
        None
    }

    /// Restores the authoritative state and re-simulates forward through
    /// the locally retained inputs.
    fn rewind(&mut self, server_snapshot: Snapshot, frame_count_to_rewind: u32, host: &mut dyn SceneHost) {
        let config = self.config.clone();
        let checked_frame = server_snapshot.input_id;

        server_snapshot.apply(&mut self.registry, host);
        self.event_snapshot_applied
            .broadcast(&(server_snapshot.clone(), frame_count_to_rewind));
        for (_, controller) in self.controllers.iter_mut() {
            if let Some(doll) = controller.doll_controller_mut() {
                doll.on_snapshot_applied(
                    frame_count_to_rewind,
                    &config,
                    &mut self.registry,
                    &mut *host,
                );
            }
        }

        // Drop the acknowledged inputs so the replay starts at index 0.
        if let Some(player) = self
            .controllers
            .get_mut(&self.local_peer)
            .and_then(|c| c.player_controller_mut())
        {
            player.notify_frame_checked(checked_frame);
        }

        let delta = config.fixed_frame_delta;
        for rewinding_index in 0..frame_count_to_rewind as usize {
            let frame = checked_frame + (rewinding_index as u32 + 1);
            self.event_rewind_frame_begin.broadcast(&(
                frame,
                rewinding_index,
                frame_count_to_rewind as usize,
            ));

            for (_, controller) in self.controllers.iter_mut() {
                if !controller.can_simulate(&self.registry) {
                    continue;
                }
                if let Some(player) = controller.player_controller_mut() {
                    player.on_rewind_frame_begin(
                        frame,
                        rewinding_index,
                        frame_count_to_rewind as usize,
                    );
                } else if let Some(doll) = controller.doll_controller_mut() {
                    doll.on_rewind_frame_begin(
                        frame,
                        rewinding_index,
                        frame_count_to_rewind as usize,
                    );
                }
            }

            // Player first, then the dolls, exactly like a live frame.
            if let Some(controller) = self.controllers.get_mut(&self.local_peer) {
                let mut ctx = ControllerCtx {
                    config: &config,
                    host: &mut *host,
                    registry: &mut self.registry,
                };
                controller.process(delta, &mut ctx);
            }
            let doll_peers: Vec<PeerId> = self
                .controllers
                .keys()
                .copied()
                .filter(|p| *p != self.local_peer)
                .collect();
            for peer in doll_peers {
                let Some(controller) = self.controllers.get_mut(&peer) else {
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

            // Refresh the recorded state for the replayed frame.
            self.record_rewound_snapshot(frame, host);
        }
    }

    fn record_rewound_snapshot(&mut self, frame: FrameIndex, host: &mut dyn SceneHost) {
        let mut snapshot = Snapshot::capture(frame, &self.registry, host);
        for (peer, controller) in &self.controllers {
            snapshot
                .peers_frames_index
                .insert(*peer, controller.current_frame_index());
        }
        self.store_client_snapshot(snapshot.clone());
        for (peer, controller) in self.controllers.iter_mut() {
            if let Some(doll) = controller.doll_controller_mut() {
                doll.on_snapshot_update_finished(*peer, &snapshot, &self.registry);
            }
        }
        self.event_snapshot_update_finished.broadcast(&snapshot);
    }

    // ------------------------------------------------------------------ rpc

    /// Entry point for every datagram the transport delivers to the client.
    pub fn rpc_receive(
        &mut self,
        sender: PeerId,
        bytes: Bytes,
        now_ms: u32,
        host: &mut dyn SceneHost,
    ) -> Result<()> {
        let mut db = DataBuffer::from_bytes(bytes.to_vec());
        let header = decode_rpc_header(&mut db)?;

        if let Some(net_id) = header.target {
            if self.registry.get_by_net_id(net_id).is_some() {
                self.event_object_rpc_received.broadcast(&(sender, bytes));
            } else {
                // Held aside until the object spawns locally.
                self.undelivered_rpcs.hold(net_id, sender, bytes);
            }
            return Ok(());
        }

        match header.rpc_id {
            RPC_SNAPSHOT => {
                let snapshot = Snapshot::decode(&mut db).context("snapshot args")?;
                self.on_server_snapshot_received(snapshot, host);
                Ok(())
            }
            RPC_RECEIVE_INPUTS => {
                // Inputs of another authority, echoed by the server for our
                // doll.
                let (authority, packet) =
                    decode_receive_inputs_args(&mut db).context("receive_inputs args")?;
                let config = self.config.clone();
                let Some(controller) = self.controllers.get_mut(&authority) else {
                    debug!(authority, "inputs for a peer without a doll yet");
                    return Ok(());
                };
                let mut ctx = ControllerCtx {
                    config: &config,
                    host: &mut *host,
                    registry: &mut self.registry,
                };
                controller.receive_inputs(&packet, now_ms, &mut ctx);
                Ok(())
            }
            RPC_TICK_RATE_ADJUSTMENT => {
                let distance = decode_tick_rate_adjustment_args(&mut db)?;
                self.ticker.adjust(distance);
                Ok(())
            }
            RPC_PEER_LATENCY => {
                for (peer, compressed) in decode_peer_latency_args(&mut db)? {
                    self.peer_latencies.insert(peer, compressed);
                }
                Ok(())
            }
            other => {
                let known = self.rpc_table.info(other).map(|info| info.name);
                warn!(rpc = other.0, ?known, sender, "rpc not handled by the client");
                Ok(())
            }
        }
    }

    /// Stores a confirmed server snapshot: merged into the accumulated
    /// state, recorded per frame, and handed to the dolls.
    fn on_server_snapshot_received(&mut self, snapshot: Snapshot, _host: &mut dyn SceneHost) {
        self.last_server_state.merge_from(&snapshot);
        let merged = self.last_server_state.clone();

        if merged.input_id.is_none() {
            // None of our inputs was consumed yet: keep it as the single
            // newest-state record; it cannot be compared against anything.
            self.server_snapshots.retain(|s| !s.input_id.is_none());
            self.server_snapshots.push(merged.clone());
        } else {
            // A real-indexed snapshot obsoletes the NONE-indexed ones.
            self.server_snapshots.retain(|s| !s.input_id.is_none());
            match self
                .server_snapshots
                .iter()
                .position(|s| s.input_id >= merged.input_id)
            {
                Some(i) if self.server_snapshots[i].input_id == merged.input_id => {
                    self.server_snapshots[i] = merged.clone();
                }
                Some(i) => self.server_snapshots.insert(i, merged.clone()),
                None => self.server_snapshots.push(merged.clone()),
            }
        }

        for (peer, controller) in self.controllers.iter_mut() {
            if let Some(doll) = controller.doll_controller_mut() {
                doll.on_received_server_snapshot(*peer, &merged, &self.registry);
            }
        }

        self.event_received_server_snapshot.broadcast(&merged);
    }
}
