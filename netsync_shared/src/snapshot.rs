//! Snapshots: per-object variable values captured at a frame boundary.

use crate::data_buffer::{DataBuffer, Level1, Level2, Level3};
use crate::frame::FrameIndex;
use crate::net::PeerId;
use crate::object::{ObjectNetId, ObjectRegistry, SceneHost, VarData, VarFlags};
use anyhow::{bail, ensure, Result};
use std::collections::BTreeMap;
use tracing::debug;

/// One named variable value inside a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct NameAndVar {
    pub name: String,
    pub value: VarData,
}

/// Record of the synchronized world at one frame.
///
/// `peers_frames_index[p]` is the index of the input from peer `p` that was
/// consumed to produce this snapshot. Invariant: every net id listed in
/// `simulated_objects` has an `object_vars` entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub input_id: FrameIndex,
    pub peers_frames_index: BTreeMap<PeerId, FrameIndex>,
    pub simulated_objects: Vec<ObjectNetId>,
    /// Indexed by net id; `None` for objects this snapshot says nothing
    /// about.
    pub object_vars: Vec<Option<Vec<NameAndVar>>>,
}

/// Outcome of comparing a server snapshot against the client record at the
/// same frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotComparison {
    Equal,
    /// Only variables flagged `SKIP_REWINDING` diverged; apply this partial
    /// snapshot without rewinding.
    NoRewindRecover(Snapshot),
    RewindRequired,
}

impl Snapshot {
    pub fn new(input_id: FrameIndex) -> Self {
        Self {
            input_id,
            ..Default::default()
        }
    }

    pub fn object_vars(&self, net_id: ObjectNetId) -> Option<&Vec<NameAndVar>> {
        self.object_vars.get(net_id.0 as usize)?.as_ref()
    }

    pub fn set_object_vars(&mut self, net_id: ObjectNetId, vars: Vec<NameAndVar>) {
        let index = net_id.0 as usize;
        if self.object_vars.len() <= index {
            self.object_vars.resize(index + 1, None);
        }
        self.object_vars[index] = Some(vars);
    }

    /// Overlays `newer` on top of this snapshot: partial snapshots carry
    /// only changed variables, so retained values survive the merge.
    pub fn merge_from(&mut self, newer: &Snapshot) {
        self.input_id = newer.input_id;
        for (peer, frame) in &newer.peers_frames_index {
            self.peers_frames_index.insert(*peer, *frame);
        }
        self.simulated_objects = newer.simulated_objects.clone();
        for (index, entry) in newer.object_vars.iter().enumerate() {
            let Some(vars) = entry else { continue };
            let net_id = ObjectNetId(index as u32);
            match self.object_vars.get_mut(index).and_then(Option::as_mut) {
                Some(existing) => {
                    for var in vars {
                        match existing.iter_mut().find(|v| v.name == var.name) {
                            Some(slot) => slot.value = var.value.clone(),
                            None => existing.push(var.clone()),
                        }
                    }
                }
                None => self.set_object_vars(net_id, vars.clone()),
            }
        }
    }

    /// Captures the current host values of every object with a net id.
    pub fn capture(
        input_id: FrameIndex,
        registry: &ObjectRegistry,
        host: &dyn SceneHost,
    ) -> Snapshot {
        let mut snapshot = Snapshot::new(input_id);
        for object in registry.iter() {
            if object.net_id.is_none() {
                continue;
            }
            snapshot.simulated_objects.push(object.net_id);
            let vars = object
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
        }
        snapshot
    }

    /// Writes every value this snapshot carries back into the host, and
    /// refreshes the registry's change-detection cache so the overwrite does
    /// not read back as a new change.
    pub fn apply(&self, registry: &mut ObjectRegistry, host: &mut dyn SceneHost) {
        for (index, entry) in self.object_vars.iter().enumerate() {
            let Some(vars) = entry else { continue };
            let net_id = ObjectNetId(index as u32);
            let Some(object) = registry.get_by_net_id_mut(net_id) else {
                debug!(net_id = net_id.0, "snapshot refers to an unknown object");
                continue;
            };
            let local_id = object.local_id;
            for var in vars {
                if let Some(descriptor) = object.var_mut(&var.name) {
                    descriptor.last_value = var.value.clone();
                }
                host.set_var(local_id, &var.name, &var.value);
            }
        }
    }

    /// Compares a server snapshot against the client record at the same
    /// frame, object by object, variable by variable.
    pub fn compare(
        server: &Snapshot,
        client: &Snapshot,
        registry: &ObjectRegistry,
        differences_info: Option<&mut Vec<String>>,
    ) -> SnapshotComparison {
        let mut info = differences_info;
        let mut recover = Snapshot::new(server.input_id);
        let mut rewind = false;

        for net_id in &server.simulated_objects {
            let Some(server_vars) = server.object_vars(*net_id) else {
                // Violated snapshot invariant on the sender side.
                debug!(net_id = net_id.0, "server snapshot without vars for a simulated object");
                continue;
            };
            let client_vars = client.object_vars(*net_id);

            let mut soft_diverged: Vec<NameAndVar> = Vec::new();
            for server_var in server_vars {
                let client_value = client_vars
                    .and_then(|vars| vars.iter().find(|v| v.name == server_var.name))
                    .map(|v| &v.value);

                if client_value == Some(&server_var.value) {
                    continue;
                }

                if let Some(info) = info.as_mut() {
                    info.push(format!(
                        "object {} var `{}` differs: server {:?} client {:?}",
                        net_id.0, server_var.name, server_var.value, client_value
                    ));
                }

                let soft = registry
                    .get_by_net_id(*net_id)
                    .and_then(|object| object.var(&server_var.name))
                    .map(|descriptor| descriptor.flags.contains(VarFlags::SKIP_REWINDING))
                    .unwrap_or(false);
                if soft {
                    soft_diverged.push(server_var.clone());
                } else {
                    rewind = true;
                }
            }
            if !soft_diverged.is_empty() {
                recover.simulated_objects.push(*net_id);
                recover.set_object_vars(*net_id, soft_diverged);
            }
        }

        if rewind {
            SnapshotComparison::RewindRequired
        } else if !recover.simulated_objects.is_empty() {
            SnapshotComparison::NoRewindRecover(recover)
        } else {
            SnapshotComparison::Equal
        }
    }

    // ------------------------------------------------------------- wire form

    pub fn encode(&self, db: &mut DataBuffer) {
        db.add_uint(self.input_id.0 as u64, Level1);

        db.add_uint(self.peers_frames_index.len() as u64, Level3);
        for (peer, frame) in &self.peers_frames_index {
            db.add_uint(*peer as u64, Level1);
            db.add_uint(frame.0 as u64, Level1);
        }

        db.add_uint(self.simulated_objects.len() as u64, Level2);
        for net_id in &self.simulated_objects {
            db.add_uint(net_id.0 as u64, Level1);
        }

        let entries: Vec<(ObjectNetId, &Vec<NameAndVar>)> = self
            .object_vars
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|vars| (ObjectNetId(i as u32), vars)))
            .collect();
        db.add_uint(entries.len() as u64, Level2);
        for (net_id, vars) in entries {
            db.add_uint(net_id.0 as u64, Level1);
            db.add_uint(vars.len() as u64, Level3);
            for var in vars {
                db.add_string(&var.name);
                var.value.encode(db);
            }
        }
    }

    pub fn decode(db: &mut DataBuffer) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new(FrameIndex(db.read_uint(Level1) as u32));

        let peers = db.read_uint(Level3);
        for _ in 0..peers {
            let peer = db.read_uint(Level1) as PeerId;
            let frame = FrameIndex(db.read_uint(Level1) as u32);
            snapshot.peers_frames_index.insert(peer, frame);
        }

        let simulated = db.read_uint(Level2);
        for _ in 0..simulated {
            snapshot
                .simulated_objects
                .push(ObjectNetId(db.read_uint(Level1) as u32));
        }

        let entries = db.read_uint(Level2);
        for _ in 0..entries {
            let net_id = ObjectNetId(db.read_uint(Level1) as u32);
            let var_count = db.read_uint(Level3);
            let mut vars = Vec::with_capacity(var_count as usize);
            for _ in 0..var_count {
                let name = db.read_string();
                let Some(value) = VarData::decode(db) else {
                    bail!("malformed snapshot var");
                };
                vars.push(NameAndVar { name, value });
            }
            ensure!(!net_id.is_none(), "malformed snapshot object id");
            snapshot.set_object_vars(net_id, vars);
        }

        ensure!(!db.is_buffer_failed(), "truncated snapshot");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vec3;
    use crate::object::ObjectLocalId;
    use std::collections::HashMap;

    struct MapHost {
        vars: HashMap<(ObjectLocalId, String), VarData>,
    }

    impl SceneHost for MapHost {
        fn get_var(&self, object: ObjectLocalId, var: &str) -> Option<VarData> {
            self.vars.get(&(object, var.to_string())).cloned()
        }
        fn set_var(&mut self, object: ObjectLocalId, var: &str, value: &VarData) {
            self.vars.insert((object, var.to_string()), value.clone());
        }
        fn collect_input(&mut self, _peer: PeerId, _delta: f32, _buf: &mut DataBuffer) {}
        fn count_input_size(&self, _peer: PeerId, _buf: &mut DataBuffer) -> u16 {
            0
        }
        fn are_inputs_different(
            &self,
            _peer: PeerId,
            _a: &mut DataBuffer,
            _b: &mut DataBuffer,
        ) -> bool {
            false
        }
        fn process(&mut self, _peer: PeerId, _delta: f32, _input: &mut DataBuffer) {}
    }

    fn snapshot_with(net_id: u32, name: &str, value: VarData) -> Snapshot {
        let mut snap = Snapshot::new(FrameIndex(10));
        snap.simulated_objects.push(ObjectNetId(net_id));
        snap.set_object_vars(
            ObjectNetId(net_id),
            vec![NameAndVar {
                name: name.into(),
                value,
            }],
        );
        snap
    }

    fn registry_with_flags(flags: VarFlags) -> ObjectRegistry {
        let mut registry = ObjectRegistry::new();
        let id = registry.register(
            "obj",
            0,
            vec![("health".into(), VarData::Int(0), flags)],
        );
        registry.set_net_id(id, ObjectNetId(0));
        registry
    }

    #[test]
    fn equal_snapshots_compare_equal() {
        let registry = registry_with_flags(VarFlags::empty());
        let a = snapshot_with(0, "health", VarData::Int(5));
        let b = snapshot_with(0, "health", VarData::Int(5));
        assert_eq!(
            Snapshot::compare(&a, &b, &registry, None),
            SnapshotComparison::Equal
        );
    }

    #[test]
    fn hard_divergence_requires_rewind() {
        let registry = registry_with_flags(VarFlags::empty());
        let server = snapshot_with(0, "health", VarData::Int(5));
        let client = snapshot_with(0, "health", VarData::Int(7));
        let mut info = Vec::new();
        assert_eq!(
            Snapshot::compare(&server, &client, &registry, Some(&mut info)),
            SnapshotComparison::RewindRequired
        );
        assert_eq!(info.len(), 1);
    }

    #[test]
    fn soft_divergence_recovers_without_rewind() {
        let registry = registry_with_flags(VarFlags::SKIP_REWINDING);
        let server = snapshot_with(0, "health", VarData::Int(5));
        let client = snapshot_with(0, "health", VarData::Int(7));
        match Snapshot::compare(&server, &client, &registry, None) {
            SnapshotComparison::NoRewindRecover(recover) => {
                assert_eq!(
                    recover.object_vars(ObjectNetId(0)).unwrap()[0].value,
                    VarData::Int(5)
                );
            }
            other => panic!("expected NoRewindRecover, got {other:?}"),
        }
    }

    #[test]
    fn missing_client_object_requires_rewind() {
        let registry = registry_with_flags(VarFlags::empty());
        let server = snapshot_with(0, "health", VarData::Int(5));
        let client = Snapshot::new(FrameIndex(10));
        assert_eq!(
            Snapshot::compare(&server, &client, &registry, None),
            SnapshotComparison::RewindRequired
        );
    }

    #[test]
    fn wire_roundtrip() {
        let mut snap = snapshot_with(3, "position", VarData::Vec3(Vec3::new(1.0, 2.0, 3.0)));
        snap.peers_frames_index.insert(2, FrameIndex(41));
        snap.peers_frames_index.insert(5, FrameIndex::NONE);

        let mut db = DataBuffer::new();
        db.begin_write(0);
        snap.encode(&mut db);
        db.dry();
        db.begin_read();
        let decoded = Snapshot::decode(&mut db).unwrap();
        assert_eq!(decoded, snap);
    }

    #[test]
    fn merge_keeps_unmentioned_vars() {
        let mut base = Snapshot::new(FrameIndex(1));
        base.simulated_objects.push(ObjectNetId(0));
        base.set_object_vars(
            ObjectNetId(0),
            vec![
                NameAndVar {
                    name: "a".into(),
                    value: VarData::Int(1),
                },
                NameAndVar {
                    name: "b".into(),
                    value: VarData::Int(2),
                },
            ],
        );

        let newer = snapshot_with(0, "b", VarData::Int(9));
        base.merge_from(&newer);

        let vars = base.object_vars(ObjectNetId(0)).unwrap();
        assert_eq!(vars.iter().find(|v| v.name == "a").unwrap().value, VarData::Int(1));
        assert_eq!(vars.iter().find(|v| v.name == "b").unwrap().value, VarData::Int(9));
        assert_eq!(base.input_id, FrameIndex(10));
    }

    #[test]
    fn apply_writes_through_the_host() {
        let mut registry = registry_with_flags(VarFlags::empty());
        let mut host = MapHost {
            vars: HashMap::new(),
        };
        let snap = snapshot_with(0, "health", VarData::Int(55));
        snap.apply(&mut registry, &mut host);
        assert_eq!(
            host.get_var(ObjectLocalId(0), "health"),
            Some(VarData::Int(55))
        );
    }
}
