//! Client-side replay of another peer's input stream.
//!
//! A doll receives the authority's inputs exactly like the server does and
//! fetches them the same way, but on its own timeline: it advances only when
//! it has an input to consume (or, when the host opts in, a guessed
//! neighbour), and it is reconciled against the per-doll snapshots the
//! server sends, not against the local client's frame counter.

use super::remote::RemoteState;
use super::{load_payload, parse_input_packet, ControllerCtx, INPUT_METADATA_BITS};
use crate::config::SyncConfig;
use crate::data_buffer::DataBuffer;
use crate::frame::{FrameIndex, FrameInput};
use crate::net::PeerId;
use crate::object::{ObjectRegistry, SceneHost};
use crate::snapshot::{Snapshot, SnapshotComparison};
use tracing::{debug, trace};

/// What a remotely-controlled object looked like when it had consumed the
/// given peer input.
#[derive(Debug, Clone, Default)]
pub struct DollSnapshot {
    pub doll_executed_input: FrameIndex,
    pub data: Snapshot,
}

#[derive(Debug)]
pub struct DollController {
    pub remote: RemoteState,
    /// Latest doll frame fully validated against the server.
    last_doll_validated_input: FrameIndex,
    /// Latest doll frame on which server and client snapshots were compared.
    last_doll_compared_input: FrameIndex,
    /// Base frame of the rewind currently queued for this doll.
    queued_frame_index_to_process: FrameIndex,
    queued_instant_to_process: Option<u32>,
    /// Authoritative per-doll records, sorted by executed input.
    server_snapshots: Vec<DollSnapshot>,
    /// Locally recorded per-doll records, sorted by executed input.
    client_snapshots: Vec<DollSnapshot>,
}

impl Default for DollController {
    fn default() -> Self {
        Self {
            remote: RemoteState::default(),
            last_doll_validated_input: FrameIndex::NONE,
            last_doll_compared_input: FrameIndex::NONE,
            queued_frame_index_to_process: FrameIndex(0),
            queued_instant_to_process: None,
            server_snapshots: Vec::new(),
            client_snapshots: Vec::new(),
        }
    }
}

impl DollController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receive_inputs(
        &mut self,
        authority: PeerId,
        data: &[u8],
        now_ms: u32,
        host: &dyn SceneHost,
    ) -> bool {
        let remote = &mut self.remote;
        let drop_at_or_before = self.last_doll_validated_input;
        let parsed = parse_input_packet(authority, data, host, |id, bit_size, payload| {
            remote.insert_input(id, bit_size, payload, now_ms, drop_at_or_before);
        });
        if let Err(error) = parsed {
            debug!(authority, %error, "doll input packet dropped");
            return false;
        }
        true
    }

    pub fn on_rewind_frame_begin(
        &mut self,
        _frame_index: FrameIndex,
        rewinding_index: usize,
        _rewinding_frame_count: usize,
    ) {
        if self.remote.streaming_paused {
            return;
        }
        // The fetch validates the rewinding index against the doll timeline.
        self.queued_instant_to_process = Some(rewinding_index as u32);
    }

    /// Target depth of the buffered input queue. A constant for now; meant
    /// to become adaptive with the observed packet loss.
    pub fn fetch_optimal_queued_inputs(&self, config: &SyncConfig) -> u32 {
        config.min_frames_delay
    }

    fn set_frame_input(&mut self, inputs_buffer: &mut DataBuffer, frame: &FrameInput) {
        load_payload(inputs_buffer, &frame.payload, frame.payload_bit_size);
        self.remote.current_input_buffer_id = frame.id;
    }

    fn fetch_next_input(
        &mut self,
        inputs_buffer: &mut DataBuffer,
        config: &SyncConfig,
    ) -> bool {
        if let Some(instant) = self.queued_instant_to_process {
            if self.queued_frame_index_to_process.is_none() {
                // The server has not started processing this doll yet.
                return false;
            }
            // The offset was decided by the lag compensation in
            // `on_snapshot_applied`; it trims or grows the replayed window
            // during the rewind.
            let frame_to_process = self.queued_frame_index_to_process + instant;
            let found = self
                .remote
                .frames_input
                .iter()
                .take_while(|f| f.id <= frame_to_process)
                .find(|f| f.id == frame_to_process)
                .cloned();
            if let Some(frame) = found {
                self.set_frame_input(inputs_buffer, &frame);
                return true;
            }
            // Compensating for missing inputs: stall this sub-step.
            self.remote.current_input_buffer_id = frame_to_process;
            return false;
        }

        if self.remote.current_input_buffer_id.is_none() {
            if let Some(frame) = self.remote.frames_input.front().cloned() {
                // Anything is good as the first input.
                self.set_frame_input(inputs_buffer, &frame);
                return true;
            }
            return false;
        }

        let next_input_id = self.remote.current_input_buffer_id + 1;

        // The searched input is likely near the end of the sorted deque.
        let mut closest: Option<usize> = None;
        let mut closest_distance = u32::MAX;
        for i in (0..self.remote.frames_input.len()).rev() {
            let id = self.remote.frames_input[i].id;
            if id == next_input_id {
                let frame = self.remote.frames_input[i].clone();
                self.set_frame_input(inputs_buffer, &frame);
                return true;
            }
            let distance = id.distance(next_input_id);
            if distance < closest_distance {
                closest = Some(i);
                closest_distance = distance;
            } else {
                break;
            }
        }

        if !config.lag_compensation.doll_allow_guess_input_when_missing {
            return false;
        }

        if let Some(i) = closest {
            // Replay the nearest input pretending it is the expected one.
            let mut guessed = self.remote.frames_input[i].clone();
            trace!(missing = %next_input_id, copied = %guessed.id, "doll input missing, guessing");
            guessed.id = next_input_id;
            self.set_frame_input(inputs_buffer, &guessed);
            return true;
        }
        false
    }

    pub fn process(
        &mut self,
        authority: PeerId,
        inputs_buffer: &mut DataBuffer,
        delta: f32,
        ctx: &mut ControllerCtx,
    ) {
        let is_new_input = self.fetch_next_input(inputs_buffer, ctx.config);

        if is_new_input {
            if self.queued_instant_to_process.is_some() {
                // The doll processes a different timeline than the client,
                // so the authoritative state for its previous frame is
                // injected here, inside the rewind.
                let current = self.remote.current_input_buffer_id;
                if current > FrameIndex(0) {
                    let previous = current - 1;
                    if let Some(snap) = self
                        .server_snapshots
                        .iter()
                        .find(|s| s.doll_executed_input == previous)
                    {
                        let data = snap.data.clone();
                        data.apply(ctx.registry, ctx.host);
                    }
                }
            }

            inputs_buffer.begin_read();
            inputs_buffer.seek(INPUT_METADATA_BITS as u32);
            ctx.host.process(authority, delta, inputs_buffer);
        }

        self.queued_instant_to_process = None;
    }

    pub fn on_state_validated(&mut self, _frame_index: FrameIndex, _desync_detected: bool) {
        self.notify_frame_checked(self.last_doll_compared_input);
        self.clear_previously_generated_client_snapshots();
    }

    fn notify_frame_checked(&mut self, doll_frame_index: FrameIndex) {
        if !self.last_doll_validated_input.is_none()
            && self.last_doll_validated_input >= doll_frame_index
        {
            return;
        }

        if !doll_frame_index.is_none() {
            // Drop the inputs older than the known one (included).
            while let Some(front) = self.remote.frames_input.front() {
                if front.id > doll_frame_index {
                    break;
                }
                if front.id == doll_frame_index {
                    self.remote.streaming_paused = front.is_empty(INPUT_METADATA_BITS);
                }
                self.remote.frames_input.pop_front();
            }
            self.server_snapshots
                .retain(|s| s.doll_executed_input >= doll_frame_index);
            self.client_snapshots
                .retain(|s| s.doll_executed_input >= doll_frame_index);
        } else {
            self.server_snapshots
                .retain(|s| !s.doll_executed_input.is_none());
            self.client_snapshots
                .retain(|s| !s.doll_executed_input.is_none());
        }

        self.last_doll_validated_input = doll_frame_index;
    }

    fn clear_previously_generated_client_snapshots(&mut self) {
        let current = self.remote.current_input_buffer_id;
        if !current.is_none() {
            // Anything newer than the doll's frame would poison the next
            // recovery-info fetch.
            self.client_snapshots
                .retain(|s| s.doll_executed_input <= current);
        }
    }

    /// Stores the doll-relevant slice of a freshly received server snapshot.
    pub fn on_received_server_snapshot(
        &mut self,
        authority: PeerId,
        snapshot: &Snapshot,
        registry: &ObjectRegistry,
    ) {
        let doll_executed_input = snapshot
            .peers_frames_index
            .get(&authority)
            .copied()
            .unwrap_or(FrameIndex::NONE);
        if !self.last_doll_validated_input.is_none()
            && self.last_doll_validated_input >= doll_executed_input
        {
            // Already checked; nothing to store.
            return;
        }

        // Keep either a single NONE-indexed snapshot or only indexed ones.
        if snapshot.input_id.is_none() || doll_executed_input.is_none() {
            self.server_snapshots.clear();
        } else {
            self.server_snapshots
                .retain(|s| !s.doll_executed_input.is_none());
        }

        copy_controlled_objects_snapshot(
            snapshot,
            &mut self.server_snapshots,
            true,
            authority,
            registry,
        );
    }

    /// Records what this doll looked like after the client finished its own
    /// frame.
    pub fn on_snapshot_update_finished(
        &mut self,
        authority: PeerId,
        snapshot: &Snapshot,
        registry: &ObjectRegistry,
    ) {
        copy_controlled_objects_snapshot(
            snapshot,
            &mut self.client_snapshots,
            false,
            authority,
            registry,
        );
    }

    fn fetch_checkable_snapshot(&self) -> Option<(usize, usize)> {
        for (client_index, client_snap) in self.client_snapshots.iter().enumerate().rev() {
            if client_snap.doll_executed_input.is_none() {
                continue;
            }
            debug_assert!(client_snap.doll_executed_input <= self.remote.current_input_buffer_id);
            if let Some(server_index) = self
                .server_snapshots
                .iter()
                .position(|s| s.doll_executed_input == client_snap.doll_executed_input)
            {
                return Some((client_index, server_index));
            }
        }
        None
    }

    /// Per-doll reconciliation check, relative to the doll timeline rather
    /// than the scene one. Returns `false` when this doll needs a rewind.
    pub fn fetch_recovery_info(
        &mut self,
        frame_count_to_rewind: u32,
        config: &SyncConfig,
        registry: &ObjectRegistry,
        no_rewind_recover: &mut Option<Snapshot>,
        differences_info: Option<&mut Vec<String>>,
    ) -> bool {
        // An excess of buffered inputs forces the reconciliation even when
        // the state matches: the doll is running too far behind.
        if frame_count_to_rewind >= config.lag_compensation.doll_force_input_reconciliation_min_frames
        {
            let optimal_queued_inputs = self.fetch_optimal_queued_inputs(config);
            let optimal_input_count = frame_count_to_rewind + optimal_queued_inputs;
            let input_count = self.remote.frames_input.len() as u32;
            if input_count > optimal_input_count + config.lag_compensation.doll_force_input_reconciliation
            {
                return false;
            }
        }

        // The doll processes a parallel timeline, so the globally checked
        // frame index is useless here: compare the newest client snapshot
        // that has a server counterpart.
        let Some((client_index, server_index)) = self.fetch_checkable_snapshot() else {
            return true;
        };
        self.last_doll_compared_input = self.client_snapshots[client_index].doll_executed_input;

        match Snapshot::compare(
            &self.server_snapshots[server_index].data,
            &self.client_snapshots[client_index].data,
            registry,
            differences_info,
        ) {
            SnapshotComparison::Equal => true,
            SnapshotComparison::NoRewindRecover(recover) => {
                match no_rewind_recover {
                    Some(existing) => existing.merge_from(&recover),
                    None => *no_rewind_recover = Some(recover),
                }
                true
            }
            SnapshotComparison::RewindRequired => false,
        }
    }

    /// Lag compensation entry point, fired when the scene applies a server
    /// snapshot (with or without a rewind window).
    pub fn on_snapshot_applied(
        &mut self,
        frame_count_to_rewind: u32,
        config: &SyncConfig,
        registry: &mut ObjectRegistry,
        host: &mut dyn SceneHost,
    ) {
        if self
            .server_snapshots
            .last()
            .map(|s| s.doll_executed_input.is_none())
            .unwrap_or(false)
        {
            self.apply_snapshot_no_input_reconciliation(registry, host);
        }

        if !self.remote.current_input_buffer_id.is_none() {
            if frame_count_to_rewind == 0 {
                self.apply_snapshot_instant_input_reconciliation(config, registry, host);
            } else {
                self.apply_snapshot_rewinding_input_reconciliation(
                    frame_count_to_rewind,
                    config,
                    registry,
                    host,
                );
            }
        }
    }

    /// The server is not simulating this doll yet: apply the latest
    /// authoritative state right away and park the timeline.
    fn apply_snapshot_no_input_reconciliation(
        &mut self,
        registry: &mut ObjectRegistry,
        host: &mut dyn SceneHost,
    ) {
        let data = self
            .server_snapshots
            .last()
            .expect("checked by the caller")
            .data
            .clone();
        data.apply(registry, host);
        self.last_doll_compared_input = FrameIndex::NONE;
        self.remote.current_input_buffer_id = FrameIndex::NONE;
        self.queued_frame_index_to_process = FrameIndex::NONE;
    }

    /// No rewind window: jump the doll to `last_received_input -
    /// optimal_queued_inputs` using the newest server snapshot at or before
    /// that point.
    fn apply_snapshot_instant_input_reconciliation(
        &mut self,
        config: &SyncConfig,
        registry: &mut ObjectRegistry,
        host: &mut dyn SceneHost,
    ) {
        let Some(last_input) = self.remote.frames_input.back() else {
            // With no inputs buffered it is better to apply nothing: once
            // inputs arrive the rewinding path will do a much cleaner job,
            // and applying now could discard inputs before they ever run.
            return;
        };

        let optimal_queued_inputs = self.fetch_optimal_queued_inputs(config);
        self.last_doll_compared_input = if last_input.id.0 >= optimal_queued_inputs {
            last_input.id - optimal_queued_inputs
        } else {
            FrameIndex(0)
        };

        let mut snapshot_to_apply: Option<usize> = None;
        for (i, snapshot) in self.server_snapshots.iter().enumerate() {
            if snapshot.doll_executed_input <= self.last_doll_compared_input {
                snapshot_to_apply = Some(i);
            } else {
                break;
            }
        }

        if let Some(i) = snapshot_to_apply {
            let snapshot = self.server_snapshots[i].clone();
            snapshot.data.apply(registry, host);
            // Bring everything back to this point.
            self.last_doll_compared_input = snapshot.doll_executed_input;
            self.remote.current_input_buffer_id = snapshot.doll_executed_input;
        }
    }

    /// A rewind window exists: offset the replayed inputs so the queue
    /// lands at `optimal_queued_inputs` when the rewind completes, provided
    /// a server snapshot exists inside the window.
    fn apply_snapshot_rewinding_input_reconciliation(
        &mut self,
        frame_count_to_rewind: u32,
        config: &SyncConfig,
        registry: &mut ObjectRegistry,
        host: &mut dyn SceneHost,
    ) {
        let optimal_queued_inputs = self.fetch_optimal_queued_inputs(config);
        let optimal_input_count = frame_count_to_rewind + optimal_queued_inputs;
        let input_count = self.remote.frames_input.len();

        let mut server_snapshot_to_apply: Option<usize> = None;
        let mut new_last_doll_compared_input = FrameIndex::NONE;

        if let Some(last_input) = self.remote.frames_input.back() {
            // The best frame to restart from: whatever leaves exactly the
            // optimal queue depth at the end of the rewind. It does not
            // matter if that input is missing; the doll just waits idle.
            new_last_doll_compared_input = if last_input.id.0 >= optimal_input_count {
                last_input.id - optimal_input_count
            } else {
                FrameIndex(0)
            };

            // A server snapshot must exist somewhere in the rewound window,
            // otherwise this rewind is skipped entirely.
            let mut server_snapshot_found = false;
            for i in (0..self.server_snapshots.len()).rev() {
                let dei = self.server_snapshots[i].doll_executed_input;
                if dei < new_last_doll_compared_input + optimal_input_count {
                    if dei > new_last_doll_compared_input {
                        // Most common case: the snapshot is applied later,
                        // mid-rewind, by `process`.
                    } else if dei == new_last_doll_compared_input {
                        server_snapshot_to_apply = Some(i);
                    } else {
                        // The snapshot predates the window: pull the window
                        // start down so it still gets applied.
                        new_last_doll_compared_input = dei;
                        server_snapshot_to_apply = Some(i);
                    }
                    server_snapshot_found = true;
                    break;
                }
            }
            if !server_snapshot_found {
                new_last_doll_compared_input = FrameIndex::NONE;
            }
        }

        if input_count == 0 || new_last_doll_compared_input.is_none() {
            // No usable window: move the timeline back enough to give the
            // missing inputs time to arrive, without advancing during the
            // rewind.
            let frames_to_travel = frame_count_to_rewind + optimal_queued_inputs;
            self.last_doll_compared_input =
                if self.remote.current_input_buffer_id > FrameIndex(frames_to_travel) {
                    self.remote.current_input_buffer_id - frames_to_travel
                } else {
                    FrameIndex(0)
                };
        } else {
            self.last_doll_compared_input = new_last_doll_compared_input;
        }

        self.queued_frame_index_to_process = self.last_doll_compared_input + 1;
        self.remote.current_input_buffer_id = self.last_doll_compared_input;

        if let Some(i) = server_snapshot_to_apply {
            let snapshot = self.server_snapshots[i].clone();
            snapshot.data.apply(registry, host);
        } else if !self.client_snapshots.is_empty() {
            // Apply the closest client snapshot; precision is not needed,
            // the server snapshot takes over when reached mid-rewind.
            let mut distance = u32::MAX;
            let mut best: Option<usize> = None;
            for (i, snap) in self.client_snapshots.iter().enumerate() {
                let delta = snap
                    .doll_executed_input
                    .distance(self.last_doll_compared_input);
                if delta < distance {
                    best = Some(i);
                    distance = delta;
                } else {
                    break;
                }
            }
            if let Some(i) = best {
                let snapshot = self.client_snapshots[i].clone();
                snapshot.data.apply(registry, host);
            }
        }
    }
}

/// Extracts the slice of `snapshot` that concerns the objects controlled by
/// `authority` into the sorted per-doll snapshot list.
fn copy_controlled_objects_snapshot(
    snapshot: &Snapshot,
    snapshots: &mut Vec<DollSnapshot>,
    store_even_when_doll_is_not_processing: bool,
    authority: PeerId,
    registry: &ObjectRegistry,
) {
    let doll_executed_input = snapshot
        .peers_frames_index
        .get(&authority)
        .copied()
        .unwrap_or(FrameIndex::NONE);
    let controlled: Vec<_> = registry.controlled_by(authority).collect();

    if !store_even_when_doll_is_not_processing
        && (doll_executed_input.is_none() || controlled.is_empty())
    {
        return;
    }

    let entry_index = match snapshots
        .iter()
        .position(|s| s.doll_executed_input == doll_executed_input)
    {
        Some(i) => i,
        None => {
            snapshots.push(DollSnapshot {
                doll_executed_input,
                data: Snapshot::default(),
            });
            snapshots.len() - 1
        }
    };

    let entry = &mut snapshots[entry_index];
    entry.data.input_id = snapshot.input_id;
    entry
        .data
        .peers_frames_index
        .insert(authority, doll_executed_input);
    entry.data.simulated_objects.clear();

    for object in controlled {
        if !snapshot.simulated_objects.contains(&object.net_id) {
            continue;
        }
        let Some(vars) = snapshot.object_vars(object.net_id) else {
            debug!(net_id = object.net_id.0, "snapshot misses vars for a simulated doll object");
            continue;
        };
        entry.data.simulated_objects.push(object.net_id);
        entry.data.set_object_vars(object.net_id, vars.clone());
    }

    snapshots.sort_by(|a, b| a.doll_executed_input.cmp(&b.doll_executed_input));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::ByteInputHost;
    use crate::data_buffer::Level3;

    fn input_frame(id: u32, value: u8) -> FrameInput {
        let mut db = DataBuffer::new();
        db.begin_write(1);
        db.seek(0);
        db.add_bool(true);
        db.add_uint(value as u64, Level3);
        db.dry();
        FrameInput {
            id: FrameIndex(id),
            payload: db.buffer().clone(),
            payload_bit_size: 9,
            similarity: FrameIndex::NONE,
            received_at_ms: 0,
        }
    }

    fn config_with_guessing(enabled: bool) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.lag_compensation.doll_allow_guess_input_when_missing = enabled;
        config
    }

    fn process_once(doll: &mut DollController, config: &SyncConfig) -> FrameIndex {
        let mut buffer = DataBuffer::new();
        let mut registry = ObjectRegistry::new();
        let mut host = ByteInputHost;
        let mut ctx = ControllerCtx {
            config,
            host: &mut host,
            registry: &mut registry,
        };
        doll.process(3, &mut buffer, 1.0 / 60.0, &mut ctx);
        doll.remote.current_input_buffer_id
    }

    #[test]
    fn advances_only_with_inputs_when_guessing_disabled() {
        let config = config_with_guessing(false);
        let mut doll = DollController::new();

        // Nothing buffered: the doll stalls.
        assert_eq!(process_once(&mut doll, &config), FrameIndex::NONE);

        doll.remote.frames_input.push_back(input_frame(0, 1));
        doll.remote.frames_input.push_back(input_frame(1, 2));
        assert_eq!(process_once(&mut doll, &config), FrameIndex(0));
        assert_eq!(process_once(&mut doll, &config), FrameIndex(1));

        // Input 2 is missing; without guessing the doll does not advance.
        doll.remote.frames_input.push_back(input_frame(3, 4));
        assert_eq!(process_once(&mut doll, &config), FrameIndex(1));
    }

    #[test]
    fn guesses_the_closest_input_when_allowed() {
        let config = config_with_guessing(true);
        let mut doll = DollController::new();
        doll.remote.frames_input.push_back(input_frame(0, 1));
        assert_eq!(process_once(&mut doll, &config), FrameIndex(0));

        // Input 1 is missing; the closest neighbour (0, distance 1) is
        // replayed renumbered as 1.
        doll.remote.frames_input.push_back(input_frame(3, 4));
        assert_eq!(process_once(&mut doll, &config), FrameIndex(1));
    }

    #[test]
    fn rewind_substep_stalls_when_the_input_is_absent() {
        let config = config_with_guessing(true);
        let mut doll = DollController::new();
        doll.remote.current_input_buffer_id = FrameIndex(4);
        doll.queued_frame_index_to_process = FrameIndex(5);
        doll.queued_instant_to_process = Some(0);

        // Frame 5 is not buffered: the doll stalls for this sub-step but
        // still tracks where its timeline would be.
        assert_eq!(process_once(&mut doll, &config), FrameIndex(5));
        assert_eq!(doll.queued_instant_to_process, None);
    }

    #[test]
    fn force_input_reconciliation_threshold() {
        let mut config = SyncConfig::default();
        config.lag_compensation.doll_force_input_reconciliation = 3;
        config.lag_compensation.doll_force_input_reconciliation_min_frames = 2;
        let registry = ObjectRegistry::new();
        let mut doll = DollController::new();

        // 12 buffered inputs against an allowance of rewind(4) + optimal(2)
        // + threshold(3) = 9 forces the reconciliation.
        for i in 0..12 {
            doll.remote.frames_input.push_back(input_frame(i, 0));
        }
        let mut recover = None;
        assert!(!doll.fetch_recovery_info(4, &config, &registry, &mut recover, None));

        // Below the min-frames gate the check is skipped entirely.
        assert!(doll.fetch_recovery_info(1, &config, &registry, &mut recover, None));
    }

    #[test]
    fn instant_reconciliation_targets_optimal_depth() {
        let config = SyncConfig::default();
        let mut registry = ObjectRegistry::new();
        let mut host = ByteInputHost;
        let mut doll = DollController::new();
        doll.remote.current_input_buffer_id = FrameIndex(9);
        for i in 0..=10 {
            doll.remote.frames_input.push_back(input_frame(i, 0));
        }
        // Server snapshots at doll frames 6 and 8.
        for dei in [6u32, 8] {
            doll.server_snapshots.push(DollSnapshot {
                doll_executed_input: FrameIndex(dei),
                data: Snapshot::new(FrameIndex(100 + dei)),
            });
        }

        doll.on_snapshot_applied(0, &config, &mut registry, &mut host);

        // target = last_received(10) - optimal(2) = 8; the newest snapshot
        // at or before 8 is 8 itself.
        assert_eq!(doll.remote.current_input_buffer_id, FrameIndex(8));
        assert_eq!(doll.last_doll_compared_input, FrameIndex(8));
    }

    #[test]
    fn rewinding_reconciliation_sets_the_replay_window() {
        let config = SyncConfig::default();
        let mut registry = ObjectRegistry::new();
        let mut host = ByteInputHost;
        let mut doll = DollController::new();
        doll.remote.current_input_buffer_id = FrameIndex(20);
        for i in 0..=20 {
            doll.remote.frames_input.push_back(input_frame(i, 0));
        }
        // A server snapshot inside the window.
        doll.server_snapshots.push(DollSnapshot {
            doll_executed_input: FrameIndex(15),
            data: Snapshot::new(FrameIndex(300)),
        });

        // rewind 4 frames, optimal 2: new start = 20 - 6 = 14; snapshot 15
        // sits inside [14, 20).
        doll.on_snapshot_applied(4, &config, &mut registry, &mut host);
        assert_eq!(doll.remote.current_input_buffer_id, FrameIndex(14));
        assert_eq!(doll.queued_frame_index_to_process, FrameIndex(15));
    }

    #[test]
    fn rewinding_reconciliation_skips_without_server_snapshot() {
        let config = SyncConfig::default();
        let mut registry = ObjectRegistry::new();
        let mut host = ByteInputHost;
        let mut doll = DollController::new();
        doll.remote.current_input_buffer_id = FrameIndex(20);
        for i in 0..=20 {
            doll.remote.frames_input.push_back(input_frame(i, 0));
        }

        doll.on_snapshot_applied(4, &config, &mut registry, &mut host);
        // No server snapshot in the window: fall back to travelling the
        // timeline back by rewind + optimal.
        assert_eq!(doll.remote.current_input_buffer_id, FrameIndex(14));
        assert_eq!(doll.last_doll_compared_input, FrameIndex(14));
    }
}
