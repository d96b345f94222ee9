//! ---
//! gcs_section: "02-telemetry-link"
//! gcs_subsection: "module"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "Bounded priority and normal dispatch lanes."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::event::EventKind;
use crate::object::{ObjectId, ObjectRef};

/// One of the two FIFO dispatch lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Priority,
    Normal,
}

impl Lane {
    /// Periodic traffic rides the normal lane; everything else jumps ahead of it.
    pub fn classify(event: EventKind, all_instances: bool) -> Lane {
        if all_instances {
            return Lane::Priority;
        }
        match event {
            EventKind::UpdatedPeriodic => Lane::Normal,
            EventKind::Unpacked
            | EventKind::Updated
            | EventKind::UpdatedManual
            | EventKind::UpdateRequest => Lane::Priority,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Priority => "priority",
            Lane::Normal => "normal",
        }
    }
}

/// Pending dispatch of one object event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueItem {
    pub object: ObjectRef,
    pub event: EventKind,
    pub all_instances: bool,
}

impl QueueItem {
    pub fn new(object: ObjectRef, event: EventKind, all_instances: bool) -> Self {
        Self {
            object,
            event,
            all_instances,
        }
    }

    pub fn lane(&self) -> Lane {
        Lane::classify(self.event, self.all_instances)
    }
}

/// Result of offering an item to a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { depth: usize },
    /// The lane was full; the offered item was discarded.
    Dropped,
}

/// Two bounded FIFO lanes; the priority lane always drains first.
#[derive(Debug)]
pub struct DispatchQueue {
    priority: VecDeque<QueueItem>,
    normal: VecDeque<QueueItem>,
    capacity: usize,
    dropped_priority: u64,
    dropped_normal: u64,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            priority: VecDeque::with_capacity(capacity),
            normal: VecDeque::with_capacity(capacity),
            capacity,
            dropped_priority: 0,
            dropped_normal: 0,
        }
    }

    /// Append to `lane` unless it is full (drop-newest).
    pub fn enqueue(&mut self, item: QueueItem, lane: Lane) -> EnqueueOutcome {
        let capacity = self.capacity;
        let (queue, dropped) = self.lane_mut(lane);
        if queue.len() >= capacity {
            *dropped += 1;
            return EnqueueOutcome::Dropped;
        }
        queue.push_back(item);
        EnqueueOutcome::Queued { depth: queue.len() }
    }

    /// Next item to dispatch: priority lane first, then normal.
    pub fn drain_one(&mut self) -> Option<QueueItem> {
        self.priority
            .pop_front()
            .or_else(|| self.normal.pop_front())
    }

    /// Remove queued items for one object instance; returns how many were removed.
    pub fn purge(&mut self, object: &ObjectRef) -> usize {
        self.retain(|item| item.object != *object)
    }

    /// Remove queued items for every instance of a type.
    pub fn purge_type(&mut self, object_id: ObjectId) -> usize {
        self.retain(|item| item.object.object_id != object_id)
    }

    /// Empty a lane, returning what it held in queue order.
    pub fn clear_lane(&mut self, lane: Lane) -> Vec<QueueItem> {
        let (queue, _) = self.lane_mut(lane);
        queue.drain(..).collect()
    }

    pub fn len(&self, lane: Lane) -> usize {
        match lane {
            Lane::Priority => self.priority.len(),
            Lane::Normal => self.normal.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.normal.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self, lane: Lane) -> u64 {
        match lane {
            Lane::Priority => self.dropped_priority,
            Lane::Normal => self.dropped_normal,
        }
    }

    fn lane_mut(&mut self, lane: Lane) -> (&mut VecDeque<QueueItem>, &mut u64) {
        match lane {
            Lane::Priority => (&mut self.priority, &mut self.dropped_priority),
            Lane::Normal => (&mut self.normal, &mut self.dropped_normal),
        }
    }

    fn retain(&mut self, keep: impl Fn(&QueueItem) -> bool) -> usize {
        let before = self.priority.len() + self.normal.len();
        self.priority.retain(|item| keep(item));
        self.normal.retain(|item| keep(item));
        before - (self.priority.len() + self.normal.len())
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new(20)
    }
}
