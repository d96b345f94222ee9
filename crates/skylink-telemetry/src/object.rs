//! ---
//! gcs_section: "02-telemetry-link"
//! gcs_subsection: "module"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "Object identities, metadata, and the handle arena."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
//! Identity and metadata mirrored from the object registry.
//!
//! The registry owns object data. The link only keeps the identities it has
//! been told about and the per-type metadata that drives scheduling, stored in
//! an arena addressed by [`ObjectHandle`].

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Result, TelemetryError};

/// Object type identifier as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

/// Instance identifier within a multi-instance object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u16);

impl InstanceId {
    /// Sentinel for single-instance objects.
    pub const SINGLE: InstanceId = InstanceId(0);
    /// Wildcard used by all-instance transactions.
    pub const ALL: InstanceId = InstanceId(u16::MAX);
}

/// Non-owning reference to one instance of a remote-mirrored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_id: ObjectId,
    pub instance_id: InstanceId,
}

impl ObjectRef {
    pub fn new(object_id: u32, instance_id: u16) -> Self {
        Self {
            object_id: ObjectId(object_id),
            instance_id: InstanceId(instance_id),
        }
    }

    /// Reference to a single-instance object.
    pub fn single(object_id: u32) -> Self {
        Self::new(object_id, InstanceId::SINGLE.0)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}/{}", self.object_id.0, self.instance_id.0)
    }
}

/// How the ground side pushes an object to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Only explicit user edits and requests reach the link.
    #[default]
    Manual,
    /// Pushed every `update_period_ms`.
    Periodic,
    /// Pushed on change, at most once per `update_period_ms`.
    ThrottledPeriodic,
    /// Pushed whenever the local value changes.
    OnChange,
}

/// Per-type metadata read from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub update_mode: UpdateMode,
    /// Zero disables periodic updates.
    pub update_period_ms: u32,
    /// Peer must acknowledge every push.
    pub acknowledged: bool,
    pub multi_instance: bool,
}

impl ObjectMetadata {
    pub fn manual() -> Self {
        Self {
            update_mode: UpdateMode::Manual,
            update_period_ms: 0,
            acknowledged: false,
            multi_instance: false,
        }
    }

    pub fn on_change() -> Self {
        Self {
            update_mode: UpdateMode::OnChange,
            ..Self::manual()
        }
    }

    pub fn periodic(period_ms: u32) -> Self {
        Self {
            update_mode: UpdateMode::Periodic,
            update_period_ms: period_ms,
            ..Self::manual()
        }
    }

    pub fn throttled(period_ms: u32) -> Self {
        Self {
            update_mode: UpdateMode::ThrottledPeriodic,
            update_period_ms: period_ms,
            ..Self::manual()
        }
    }

    pub fn with_ack(mut self, acknowledged: bool) -> Self {
        self.acknowledged = acknowledged;
        self
    }

    pub fn with_multi_instance(mut self, multi_instance: bool) -> Self {
        self.multi_instance = multi_instance;
        self
    }

    /// Period fed to the scheduler; zero when the mode never ticks.
    pub fn schedule_period_ms(&self) -> u32 {
        match self.update_mode {
            UpdateMode::Periodic | UpdateMode::ThrottledPeriodic => self.update_period_ms,
            UpdateMode::Manual | UpdateMode::OnChange => 0,
        }
    }
}

/// Compact arena handle for a registered (object, instance) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    index: u32,
    generation: u32,
}

/// Throttle window for [`UpdateMode::ThrottledPeriodic`] types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThrottleGate {
    /// The next change is pushed immediately.
    #[default]
    Open,
    /// An update went out; further changes wait for the next period tick.
    Holding { pending: bool },
}

#[derive(Debug, Clone)]
struct TypeEntry {
    metadata: ObjectMetadata,
    throttle: ThrottleGate,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    object: Option<ObjectRef>,
}

/// Arena of registered objects plus their per-type metadata.
#[derive(Debug, Default)]
pub struct ObjectTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: HashMap<ObjectRef, ObjectHandle>,
    types: HashMap<ObjectId, TypeEntry>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the metadata of an object type. Returns the previous value.
    pub fn set_metadata(
        &mut self,
        object_id: ObjectId,
        metadata: ObjectMetadata,
    ) -> Option<ObjectMetadata> {
        match self.types.get_mut(&object_id) {
            Some(entry) => {
                let previous = entry.metadata;
                entry.metadata = metadata;
                entry.throttle = ThrottleGate::Open;
                Some(previous)
            }
            None => {
                self.types.insert(
                    object_id,
                    TypeEntry {
                        metadata,
                        throttle: ThrottleGate::Open,
                    },
                );
                None
            }
        }
    }

    /// Register an instance of a known type. Idempotent.
    pub fn insert(&mut self, object: ObjectRef) -> Result<ObjectHandle> {
        if !self.types.contains_key(&object.object_id) {
            return Err(TelemetryError::UnknownObject(object));
        }
        if let Some(handle) = self.index.get(&object) {
            return Ok(*handle);
        }
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.object = Some(object);
                ObjectHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    object: Some(object),
                });
                ObjectHandle {
                    index,
                    generation: 0,
                }
            }
        };
        self.index.insert(object, handle);
        Ok(handle)
    }

    /// Drop one instance. The type metadata stays until [`ObjectTable::remove_type`].
    pub fn remove(&mut self, object: &ObjectRef) -> Option<ObjectHandle> {
        let handle = self.index.remove(object)?;
        let slot = &mut self.slots[handle.index as usize];
        slot.object = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(handle)
    }

    /// Drop a type together with every registered instance; returns the removed instances.
    pub fn remove_type(&mut self, object_id: ObjectId) -> Vec<ObjectRef> {
        let instances = self.instances_of(object_id);
        for object in &instances {
            self.remove(object);
        }
        self.types.remove(&object_id);
        instances
    }

    pub fn handle(&self, object: &ObjectRef) -> Option<ObjectHandle> {
        self.index.get(object).copied()
    }

    /// Resolve a handle; stale handles from removed objects yield `None`.
    pub fn get(&self, handle: ObjectHandle) -> Option<&ObjectRef> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.object.as_ref()
    }

    pub fn metadata(&self, handle: ObjectHandle) -> Option<&ObjectMetadata> {
        let object = self.get(handle)?;
        self.types.get(&object.object_id).map(|entry| &entry.metadata)
    }

    pub fn metadata_for(&self, object_id: ObjectId) -> Option<&ObjectMetadata> {
        self.types.get(&object_id).map(|entry| &entry.metadata)
    }

    pub fn throttle(&self, object_id: ObjectId) -> Option<ThrottleGate> {
        self.types.get(&object_id).map(|entry| entry.throttle)
    }

    pub fn set_throttle(&mut self, object_id: ObjectId, gate: ThrottleGate) {
        if let Some(entry) = self.types.get_mut(&object_id) {
            entry.throttle = gate;
        }
    }

    /// Registered instances of a type in instance order.
    pub fn instances_of(&self, object_id: ObjectId) -> Vec<ObjectRef> {
        let mut instances: Vec<ObjectRef> = self
            .index
            .keys()
            .filter(|object| object.object_id == object_id)
            .copied()
            .collect();
        instances.sort();
        instances
    }

    pub fn contains(&self, object: &ObjectRef) -> bool {
        self.index.contains_key(object)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
