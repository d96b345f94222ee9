//! ---
//! gcs_section: "02-telemetry-link"
//! gcs_subsection: "module"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "Periodic update countdowns for registered objects."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use skylink_common::time::duration_to_millis;
use skylink_common::LinkConfig;
use tracing::trace;

use crate::object::{ObjectId, ObjectRef};

/// Countdown state for one periodically updated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub object: ObjectRef,
    pub period_ms: u32,
    pub time_to_next_ms: i64,
}

/// Produces `UpdatedPeriodic` events from per-object countdowns.
#[derive(Debug)]
pub struct UpdateScheduler {
    entries: IndexMap<ObjectRef, ScheduleEntry>,
    min_period_ms: u32,
    max_period_ms: u32,
    stagger: bool,
    rng: StdRng,
    next_tick_ms: u32,
}

impl UpdateScheduler {
    pub fn new(config: &LinkConfig) -> Self {
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let max_period_ms = duration_to_millis(config.max_update_period);
        Self {
            entries: IndexMap::new(),
            min_period_ms: duration_to_millis(config.min_update_period),
            max_period_ms,
            stagger: config.stagger_initial_updates,
            rng,
            next_tick_ms: max_period_ms,
        }
    }

    /// Schedule `object` every `period_ms`, or stop scheduling it when the period is zero.
    ///
    /// Returns the effective (clamped) period. Re-registering an object restarts
    /// its countdown.
    pub fn register(&mut self, object: ObjectRef, period_ms: u32) -> Option<u32> {
        if period_ms == 0 {
            self.unregister(&object);
            return None;
        }
        let period_ms = period_ms.clamp(self.min_period_ms, self.max_period_ms);
        let time_to_next_ms = if self.stagger {
            self.rng.gen_range(0..=period_ms)
        } else {
            period_ms
        };
        trace!(
            object_id = object.object_id.0,
            instance_id = object.instance_id.0,
            period_ms,
            time_to_next_ms,
            "scheduled periodic updates"
        );
        self.entries.insert(
            object,
            ScheduleEntry {
                object,
                period_ms,
                time_to_next_ms: i64::from(time_to_next_ms),
            },
        );
        self.recompute();
        Some(period_ms)
    }

    pub fn unregister(&mut self, object: &ObjectRef) -> bool {
        let removed = self.entries.shift_remove(object).is_some();
        if removed {
            self.recompute();
        }
        removed
    }

    /// Remove every instance of a type; returns how many entries were dropped.
    pub fn unregister_type(&mut self, object_id: ObjectId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|object, _| object.object_id != object_id);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.recompute();
        }
        removed
    }

    /// Advance every countdown by `elapsed_ms` and return the objects that are due.
    pub fn tick(&mut self, elapsed_ms: u32) -> Vec<ObjectRef> {
        let mut due = Vec::new();
        for entry in self.entries.values_mut() {
            entry.time_to_next_ms -= i64::from(elapsed_ms);
            if entry.time_to_next_ms <= 0 {
                let period = i64::from(entry.period_ms);
                let overshoot = (-entry.time_to_next_ms) % period;
                entry.time_to_next_ms = period - overshoot;
                due.push(entry.object);
            }
        }
        self.recompute();
        due
    }

    /// Delay until the next tick is needed.
    pub fn next_tick_ms(&self) -> u32 {
        self.next_tick_ms
    }

    pub fn entry(&self, object: &ObjectRef) -> Option<&ScheduleEntry> {
        self.entries.get(object)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn recompute(&mut self) {
        let min_remaining = self
            .entries
            .values()
            .map(|entry| entry.time_to_next_ms.max(0))
            .min()
            .map(|ms| u32::try_from(ms).unwrap_or(u32::MAX))
            .unwrap_or(self.max_period_ms);
        self.next_tick_ms = min_remaining.clamp(self.min_period_ms, self.max_period_ms);
    }
}
