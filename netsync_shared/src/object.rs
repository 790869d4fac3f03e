//! Synchronized object model.
//!
//! The host application (scene graph, ECS, whatever drives the simulation)
//! stays outside the core: objects are registered here as descriptors and
//! every value access goes through the [`SceneHost`] trait. The core only
//! keeps what it needs to diff, encode and apply state.

use crate::data_buffer::{DataBuffer, Level0, Level1, Level3};
use crate::math::{Vec2, Vec3};
use crate::net::PeerId;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::error;

/// Process-local handle of a registered object. Stable for the lifetime of
/// the registration, never reused while the object exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocalId(pub u32);

impl ObjectLocalId {
    pub const NONE: ObjectLocalId = ObjectLocalId(u32::MAX);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// Small integer assigned by the server; the wire identity of an object.
/// Never reused while a peer may still reference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectNetId(pub u32);

impl ObjectNetId {
    pub const NONE: ObjectNetId = ObjectNetId(u32::MAX);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// One synchronized variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VarData {
    Bool(bool),
    Int(i64),
    Real(f64),
    Vec2(Vec2),
    Vec3(Vec3),
}

impl VarData {
    const TAG_BOOL: u64 = 0;
    const TAG_INT: u64 = 1;
    const TAG_REAL: u64 = 2;
    const TAG_VEC2: u64 = 3;
    const TAG_VEC3: u64 = 4;

    /// Encodes a type tag then the value through the typed codec.
    pub fn encode(&self, db: &mut DataBuffer) {
        match self {
            VarData::Bool(v) => {
                db.add_uint(Self::TAG_BOOL, Level3);
                db.add_bool(*v);
            }
            VarData::Int(v) => {
                db.add_uint(Self::TAG_INT, Level3);
                db.add_int(*v, Level0);
            }
            VarData::Real(v) => {
                db.add_uint(Self::TAG_REAL, Level3);
                db.add_real(*v, Level0);
            }
            VarData::Vec2(v) => {
                db.add_uint(Self::TAG_VEC2, Level3);
                db.add_vector2(*v, Level1);
            }
            VarData::Vec3(v) => {
                db.add_uint(Self::TAG_VEC3, Level3);
                db.add_vector3(*v, Level1);
            }
        }
    }

    pub fn decode(db: &mut DataBuffer) -> Option<VarData> {
        let tag = db.read_uint(Level3);
        if db.is_buffer_failed() {
            return None;
        }
        let value = match tag {
            Self::TAG_BOOL => VarData::Bool(db.read_bool()),
            Self::TAG_INT => VarData::Int(db.read_int(Level0)),
            Self::TAG_REAL => VarData::Real(db.read_real(Level0)),
            Self::TAG_VEC2 => VarData::Vec2(db.read_vector2(Level1)),
            Self::TAG_VEC3 => VarData::Vec3(db.read_vector3(Level1)),
            _ => {
                error!(tag, "unknown var data tag");
                return None;
            }
        };
        if db.is_buffer_failed() {
            return None;
        }
        Some(value)
    }
}

bitflags! {
    /// Per-variable synchronization behaviour.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VarFlags: u8 {
        /// A divergence on this variable is recovered by overwriting the
        /// client value, without triggering a rewind.
        const SKIP_REWINDING = 0b0000_0001;
    }
}

/// Descriptor of one synchronized variable of one object.
#[derive(Debug, Clone)]
pub struct VarDescriptor {
    pub name: String,
    pub flags: VarFlags,
    /// Last value observed by the change detection.
    pub last_value: VarData,
    pub changed: bool,
}

/// An application-owned record tracked by the synchronizer.
#[derive(Debug, Clone)]
pub struct ObjectData {
    pub local_id: ObjectLocalId,
    pub net_id: ObjectNetId,
    pub name: String,
    /// Peer controlling this object; 0 when nobody does.
    pub controlled_by_peer: PeerId,
    pub vars: Vec<VarDescriptor>,
    /// Set per-client: whether this object is part of the client's active
    /// simulation.
    pub realtime_sync_enabled_on_client: bool,
}

impl ObjectData {
    pub fn var(&self, name: &str) -> Option<&VarDescriptor> {
        self.vars.iter().find(|v| v.name == name)
    }

    pub fn var_mut(&mut self, name: &str) -> Option<&mut VarDescriptor> {
        self.vars.iter_mut().find(|v| v.name == name)
    }
}

/// Arena of registered objects, indexed both by local and by net id.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: Vec<Option<ObjectData>>,
    net_index: HashMap<ObjectNetId, ObjectLocalId>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an object and returns its local id. Registering the same
    /// name twice is a programming bug.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        controlled_by_peer: PeerId,
        vars: Vec<(String, VarData, VarFlags)>,
    ) -> ObjectLocalId {
        let name = name.into();
        debug_assert!(
            !self
                .objects
                .iter()
                .flatten()
                .any(|object| object.name == name),
            "object registered twice"
        );
        let local_id = ObjectLocalId(self.objects.len() as u32);
        self.objects.push(Some(ObjectData {
            local_id,
            net_id: ObjectNetId::NONE,
            name,
            controlled_by_peer,
            vars: vars
                .into_iter()
                .map(|(name, value, flags)| VarDescriptor {
                    name,
                    flags,
                    last_value: value,
                    changed: false,
                })
                .collect(),
            realtime_sync_enabled_on_client: true,
        }));
        local_id
    }

    /// Removes an object; the local id is never handed out again.
    pub fn unregister(&mut self, local_id: ObjectLocalId) {
        let Some(slot) = self.objects.get_mut(local_id.0 as usize) else {
            error!(?local_id, "unregister of an unknown object");
            return;
        };
        if let Some(object) = slot.take() {
            self.net_index.remove(&object.net_id);
        }
    }

    /// Binds the server-assigned net id to the object.
    pub fn set_net_id(&mut self, local_id: ObjectLocalId, net_id: ObjectNetId) {
        if let Some(object) = self.get_mut(local_id) {
            object.net_id = net_id;
        }
        if !net_id.is_none() {
            self.net_index.insert(net_id, local_id);
        }
    }

    pub fn get(&self, local_id: ObjectLocalId) -> Option<&ObjectData> {
        self.objects.get(local_id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, local_id: ObjectLocalId) -> Option<&mut ObjectData> {
        self.objects.get_mut(local_id.0 as usize)?.as_mut()
    }

    pub fn get_by_net_id(&self, net_id: ObjectNetId) -> Option<&ObjectData> {
        self.get(*self.net_index.get(&net_id)?)
    }

    pub fn get_by_net_id_mut(&mut self, net_id: ObjectNetId) -> Option<&mut ObjectData> {
        let local_id = *self.net_index.get(&net_id)?;
        self.get_mut(local_id)
    }

    /// Iterates the live objects in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ObjectData> {
        self.objects.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ObjectData> {
        self.objects.iter_mut().flatten()
    }

    /// Live objects controlled by `peer`, in registration order.
    pub fn controlled_by(&self, peer: PeerId) -> impl Iterator<Item = &ObjectData> {
        self.iter().filter(move |object| object.controlled_by_peer == peer)
    }
}

/// The host application surface the core drives.
///
/// Variable access covers snapshot capture and state overwrite; the
/// per-peer hooks cover input collection and consumption for the objects a
/// peer controls. The input buffers handed to the hooks are positioned past
/// the metadata bit.
pub trait SceneHost {
    fn get_var(&self, object: ObjectLocalId, var: &str) -> Option<VarData>;
    fn set_var(&mut self, object: ObjectLocalId, var: &str, value: &VarData);

    /// Writes this frame's inputs for every object controlled by `peer`.
    fn collect_input(&mut self, peer: PeerId, delta: f32, buf: &mut DataBuffer);
    /// Reports how many payload bits a collected input occupies, reading
    /// from the buffer at its current cursor.
    fn count_input_size(&self, peer: PeerId, buf: &mut DataBuffer) -> u16;
    /// Compares two input payloads for equivalence.
    fn are_inputs_different(&self, peer: PeerId, a: &mut DataBuffer, b: &mut DataBuffer) -> bool;
    /// Advances the simulation of the objects controlled by `peer` using the
    /// given input payload.
    fn process(&mut self, peer: PeerId, delta: f32, input: &mut DataBuffer);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position() -> (String, VarData, VarFlags) {
        ("position".into(), VarData::Vec3(Vec3::ZERO), VarFlags::empty())
    }

    #[test]
    fn register_and_lookup_by_net_id() {
        let mut registry = ObjectRegistry::new();
        let id = registry.register("player", 2, vec![position()]);
        registry.set_net_id(id, ObjectNetId(7));

        let object = registry.get_by_net_id(ObjectNetId(7)).unwrap();
        assert_eq!(object.local_id, id);
        assert_eq!(object.controlled_by_peer, 2);
        assert!(object.var("position").is_some());
    }

    #[test]
    fn unregister_clears_both_indices() {
        let mut registry = ObjectRegistry::new();
        let id = registry.register("thing", 0, vec![]);
        registry.set_net_id(id, ObjectNetId(1));
        registry.unregister(id);
        assert!(registry.get(id).is_none());
        assert!(registry.get_by_net_id(ObjectNetId(1)).is_none());
    }

    #[test]
    fn var_data_codec_roundtrip() {
        let values = [
            VarData::Bool(true),
            VarData::Int(-77),
            VarData::Real(2.5),
            VarData::Vec2(Vec2::new(1.0, -2.0)),
            VarData::Vec3(Vec3::new(0.5, 0.25, -8.0)),
        ];
        let mut db = DataBuffer::new();
        db.begin_write(0);
        for value in &values {
            value.encode(&mut db);
        }
        db.begin_read();
        for value in &values {
            assert_eq!(VarData::decode(&mut db).as_ref(), Some(value));
        }
    }
}
