//! Server-side partition of objects and peers.
//!
//! A sync group decides which objects and which peers exchange snapshots
//! with each other. Objects are either *simulated* (sent every frame, with
//! per-variable change tracking) or *trickled* (sent by accumulated
//! priority). The group never reaches back into the synchronizer: whenever
//! a listener/simulating-peer relation changes, the caller-supplied
//! callback relays it to the affected controllers.

use netsync_shared::net::PeerId;
use netsync_shared::object::{ObjectLocalId, ObjectRegistry};
use tracing::error;

/// Relayed to `PeerNetworkedController::server_set_peer_simulating_this_controller`:
/// `(authority peer, listening peer, simulating)`.
pub type ListenerNotify<'a> = &'a mut dyn FnMut(PeerId, PeerId, bool);

/// Per-object record of what changed since the last notified snapshot.
#[derive(Debug, Clone, Default)]
pub struct VarChange {
    /// The object itself is new to the group; everything must be sent.
    pub unknown: bool,
    /// Variables changed since the last snapshot.
    pub vars: Vec<String>,
    /// Variables never sent to this group yet.
    pub unknown_vars: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SimulatedObjectInfo {
    pub local_id: ObjectLocalId,
    pub change: VarChange,
}

impl SimulatedObjectInfo {
    pub fn new(local_id: ObjectLocalId) -> Self {
        Self {
            local_id,
            change: VarChange::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrickledObjectInfo {
    pub local_id: ObjectLocalId,
    /// Priority gained per frame; higher climbs the send queue faster.
    pub update_rate: f32,
    pub update_priority: f32,
    pub unknown: bool,
}

impl TrickledObjectInfo {
    pub fn new(local_id: ObjectLocalId) -> Self {
        Self {
            local_id,
            update_rate: 1.0,
            update_priority: 0.0,
            unknown: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncGroup {
    simulated: Vec<SimulatedObjectInfo>,
    trickled: Vec<TrickledObjectInfo>,
    /// Peers controlling any object of the group.
    networked_peers: Vec<PeerId>,
    /// Peers controlling at least one simulated object of the group.
    simulating_peers: Vec<PeerId>,
    /// Peers receiving this group's snapshots.
    listening_peers: Vec<PeerId>,
    peers_with_newly_calculated_latency: Vec<PeerId>,
    simulated_list_changed: bool,
    trickled_list_changed: bool,
}

fn insert_unique(list: &mut Vec<PeerId>, peer: PeerId) -> bool {
    if list.contains(&peer) {
        return false;
    }
    list.push(peer);
    true
}

fn remove_value(list: &mut Vec<PeerId>, peer: PeerId) {
    list.retain(|p| *p != peer);
}

impl SyncGroup {
    pub fn simulated(&self) -> &[SimulatedObjectInfo] {
        &self.simulated
    }

    pub fn simulated_mut(&mut self) -> &mut [SimulatedObjectInfo] {
        &mut self.simulated
    }

    pub fn trickled(&self) -> &[TrickledObjectInfo] {
        &self.trickled
    }

    pub fn networked_peers(&self) -> &[PeerId] {
        &self.networked_peers
    }

    pub fn simulating_peers(&self) -> &[PeerId] {
        &self.simulating_peers
    }

    pub fn listening_peers(&self) -> &[PeerId] {
        &self.listening_peers
    }

    pub fn peers_with_newly_calculated_latency(&self) -> &[PeerId] {
        &self.peers_with_newly_calculated_latency
    }

    pub fn is_simulated_list_changed(&self) -> bool {
        self.simulated_list_changed
    }

    pub fn is_trickled_list_changed(&self) -> bool {
        self.trickled_list_changed
    }

    pub fn has_object(&self, local_id: ObjectLocalId) -> bool {
        self.find_simulated(local_id).is_some() || self.find_trickled(local_id).is_some()
    }

    fn find_simulated(&self, local_id: ObjectLocalId) -> Option<usize> {
        self.simulated.iter().position(|info| info.local_id == local_id)
    }

    fn find_trickled(&self, local_id: ObjectLocalId) -> Option<usize> {
        self.trickled.iter().position(|info| info.local_id == local_id)
    }

    /// Adds an object to the simulated or trickled list, idempotently; an
    /// object already present in the other list is moved.
    pub fn add_sync_object(
        &mut self,
        registry: &ObjectRegistry,
        local_id: ObjectLocalId,
        is_simulated: bool,
        notify: ListenerNotify,
    ) -> usize {
        if is_simulated {
            if let Some(index) = self.find_trickled(local_id) {
                self.remove_sync_object_at(registry, index, false, notify);
            }
        } else if let Some(index) = self.find_simulated(local_id) {
            self.remove_sync_object_at(registry, index, true, notify);
        }

        let controlled_by = registry
            .get(local_id)
            .map(|object| object.controlled_by_peer)
            .unwrap_or(0);

        if controlled_by > 0 {
            // A controller with an associated peer joins the networked set,
            // simulated or not.
            if insert_unique(&mut self.networked_peers, controlled_by) {
                insert_unique(&mut self.peers_with_newly_calculated_latency, controlled_by);
            }
        }

        if is_simulated {
            if let Some(index) = self.find_simulated(local_id) {
                return index;
            }
            let index = self.simulated.len();
            let mut info = SimulatedObjectInfo::new(local_id);
            info.change.unknown = true;
            if let Some(object) = registry.get(local_id) {
                for var in &object.vars {
                    info.change.vars.push(var.name.clone());
                    info.change.unknown_vars.push(var.name.clone());
                }
            }
            self.simulated.push(info);
            self.simulated_list_changed = true;

            if controlled_by > 0 && insert_unique(&mut self.simulating_peers, controlled_by) {
                for listener in &self.listening_peers {
                    notify(controlled_by, *listener, true);
                }
            }
            index
        } else {
            if let Some(index) = self.find_trickled(local_id) {
                return index;
            }
            let index = self.trickled.len();
            let mut info = TrickledObjectInfo::new(local_id);
            info.unknown = true;
            self.trickled.push(info);
            self.trickled_list_changed = true;
            index
        }
    }

    pub fn remove_sync_object(
        &mut self,
        registry: &ObjectRegistry,
        local_id: ObjectLocalId,
        notify: ListenerNotify,
    ) {
        if let Some(index) = self.find_simulated(local_id) {
            // An object lives in one list only; no need to check the other.
            self.remove_sync_object_at(registry, index, true, notify);
            return;
        }
        if let Some(index) = self.find_trickled(local_id) {
            self.remove_sync_object_at(registry, index, false, notify);
        }
    }

    fn remove_sync_object_at(
        &mut self,
        registry: &ObjectRegistry,
        index: usize,
        is_simulated: bool,
        notify: ListenerNotify,
    ) {
        let local_id = if is_simulated {
            let info = self.simulated.remove(index);
            self.simulated_list_changed = true;
            info.local_id
        } else {
            let info = self.trickled.remove(index);
            self.trickled_list_changed = true;
            info.local_id
        };

        let associated_peer = registry
            .get(local_id)
            .map(|object| object.controlled_by_peer)
            .unwrap_or(0);
        self.validate_peer_association(registry, associated_peer, notify);
    }

    /// Diff-based replacement: retained entries keep their change records,
    /// removed entries leave, new entries join.
    pub fn replace_objects(
        &mut self,
        registry: &ObjectRegistry,
        new_simulated: Vec<SimulatedObjectInfo>,
        new_trickled: Vec<TrickledObjectInfo>,
        notify: ListenerNotify,
    ) {
        let mut to_add = new_simulated;
        for index in (0..self.simulated.len()).rev() {
            let local_id = self.simulated[index].local_id;
            match to_add.iter().position(|info| info.local_id == local_id) {
                None => self.remove_sync_object_at(registry, index, true, notify),
                Some(existing) => {
                    to_add.swap_remove(existing);
                }
            }
        }
        for info in to_add {
            self.add_sync_object(registry, info.local_id, true, notify);
        }

        let mut to_add = new_trickled;
        for index in (0..self.trickled.len()).rev() {
            let local_id = self.trickled[index].local_id;
            match to_add.iter().position(|info| info.local_id == local_id) {
                None => self.remove_sync_object_at(registry, index, false, notify),
                Some(existing) => {
                    let incoming = to_add.swap_remove(existing);
                    let retained = &mut self.trickled[index];
                    retained.update_rate = incoming.update_rate;
                }
            }
        }
        for info in to_add {
            let index = self.add_sync_object(registry, info.local_id, false, notify);
            self.trickled[index].update_rate = info.update_rate;
        }
    }

    pub fn remove_all_objects(&mut self) {
        if !self.simulated.is_empty() {
            self.simulated.clear();
            self.simulated_list_changed = true;
        }
        if !self.trickled.is_empty() {
            self.trickled.clear();
            self.trickled_list_changed = true;
        }
        self.networked_peers.clear();
        self.simulating_peers.clear();
        self.peers_with_newly_calculated_latency.clear();
    }

    pub fn add_listening_peer(&mut self, peer: PeerId, notify: ListenerNotify) {
        insert_unique(&mut self.listening_peers, peer);
        // A fresh listener needs the full state once.
        for info in &mut self.simulated {
            info.change.unknown = true;
        }
        for info in &mut self.trickled {
            info.unknown = true;
        }
        for simulating in &self.simulating_peers {
            notify(*simulating, peer, true);
        }
    }

    pub fn remove_listening_peer(&mut self, peer: PeerId, notify: ListenerNotify) {
        remove_value(&mut self.listening_peers, peer);
        for simulating in &self.simulating_peers {
            notify(*simulating, peer, false);
        }
    }

    pub fn notify_new_variable(&mut self, local_id: ObjectLocalId, var_name: &str) {
        let Some(index) = self.find_simulated(local_id) else {
            return;
        };
        let change = &mut self.simulated[index].change;
        if !change.vars.iter().any(|v| v == var_name) {
            change.vars.push(var_name.to_string());
        }
        if !change.unknown_vars.iter().any(|v| v == var_name) {
            change.unknown_vars.push(var_name.to_string());
        }
    }

    pub fn notify_variable_changed(&mut self, local_id: ObjectLocalId, var_name: &str) {
        let Some(index) = self.find_simulated(local_id) else {
            return;
        };
        let change = &mut self.simulated[index].change;
        if !change.vars.iter().any(|v| v == var_name) {
            change.vars.push(var_name.to_string());
        }
    }

    /// Re-validates peer membership after an object changed its controller.
    pub fn notify_controller_changed(
        &mut self,
        registry: &ObjectRegistry,
        local_id: ObjectLocalId,
        previous_controlling_peer: PeerId,
        notify: ListenerNotify,
    ) {
        let current = registry
            .get(local_id)
            .map(|object| object.controlled_by_peer)
            .unwrap_or(0);
        if current == previous_controlling_peer {
            return;
        }

        let is_simulated = self.find_simulated(local_id).is_some();
        if !is_simulated && self.find_trickled(local_id).is_none() {
            return;
        }

        self.validate_peer_association(registry, previous_controlling_peer, notify);

        if current > 0 {
            if is_simulated && insert_unique(&mut self.simulating_peers, current) {
                for listener in &self.listening_peers {
                    notify(current, *listener, true);
                }
            }
            if insert_unique(&mut self.networked_peers, current) {
                insert_unique(&mut self.peers_with_newly_calculated_latency, current);
            }
        }
    }

    pub fn notify_peer_has_newly_calculated_latency(&mut self, peer: PeerId) {
        if self.networked_peers.contains(&peer) {
            insert_unique(&mut self.peers_with_newly_calculated_latency, peer);
        }
    }

    fn validate_peer_association(
        &mut self,
        registry: &ObjectRegistry,
        peer: PeerId,
        notify: ListenerNotify,
    ) {
        if peer == 0 {
            return;
        }

        let controls = |local_id: ObjectLocalId| {
            registry
                .get(local_id)
                .map(|object| object.controlled_by_peer == peer)
                .unwrap_or(false)
        };

        let is_simulating = self.simulated.iter().any(|info| controls(info.local_id));
        let is_networking =
            is_simulating || self.trickled.iter().any(|info| controls(info.local_id));

        if !is_simulating {
            remove_value(&mut self.simulating_peers, peer);
            for listener in &self.listening_peers {
                notify(peer, *listener, false);
            }
        }
        if !is_networking {
            remove_value(&mut self.networked_peers, peer);
            remove_value(&mut self.peers_with_newly_calculated_latency, peer);
        }
    }

    /// Accumulates trickled priorities for one frame.
    pub fn advance_trickled_priorities(&mut self) {
        for info in &mut self.trickled {
            info.update_priority += info.update_rate;
        }
    }

    /// Stable sort by accumulated priority, descending, so the top entries
    /// are the ones to transmit this frame.
    pub fn sort_trickled_by_update_priority(&mut self) {
        self.trickled
            .sort_by(|a, b| b.update_priority.total_cmp(&a.update_priority));
    }

    /// Marks the first `count` trickled entries as transmitted.
    pub fn mark_trickled_sent(&mut self, count: usize) {
        for info in self.trickled.iter_mut().take(count) {
            info.update_priority = 0.0;
            info.unknown = false;
        }
    }

    pub fn set_trickled_update_rate(&mut self, local_id: ObjectLocalId, update_rate: f32) {
        match self.find_trickled(local_id) {
            Some(index) => self.trickled[index].update_rate = update_rate,
            None => error!(?local_id, "object not found in the trickled list"),
        }
    }

    /// Clears every change record once a snapshot has been composed.
    pub fn mark_changes_as_notified(&mut self) {
        for info in &mut self.simulated {
            info.change.unknown = false;
            info.change.unknown_vars.clear();
            info.change.vars.clear();
        }
        for info in &mut self.trickled {
            info.unknown = false;
        }
        self.simulated_list_changed = false;
        self.trickled_list_changed = false;
        self.peers_with_newly_calculated_latency.clear();
    }
}
