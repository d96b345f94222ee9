//! ---
//! gcs_section: "02-telemetry-link"
//! gcs_subsection: "module"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "In-flight transaction map and deadline heap."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
//! At most one live transaction per [`TransactionKey`].
//!
//! Deadlines are kept in a single min-heap. Each arm stamps a fresh generation on
//! the transaction; heap entries whose generation no longer matches (resolved,
//! cancelled, or re-armed transactions) are discarded when they surface.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::object::{InstanceId, ObjectId, ObjectRef};
use crate::{Result, TelemetryError};

/// Slot identity for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionKey {
    pub object_id: ObjectId,
    pub instance_id: InstanceId,
}

impl TransactionKey {
    /// All-instance transactions share the [`InstanceId::ALL`] slot of their type.
    pub fn for_object(object: &ObjectRef, all_instances: bool) -> Self {
        Self {
            object_id: object.object_id,
            instance_id: if all_instances {
                InstanceId::ALL
            } else {
                object.instance_id
            },
        }
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}/{}", self.object_id.0, self.instance_id.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Sent { retries_remaining: u8 },
    Acknowledged,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub key: TransactionKey,
    pub object: ObjectRef,
    pub all_instances: bool,
    pub is_request: bool,
    /// The object's metadata asks for an acknowledgment.
    pub requires_ack: bool,
    pub retries_remaining: u8,
    /// Transmissions so far, including the first.
    pub attempts: u32,
    pub started_at: Instant,
    pub deadline: Instant,
    pub state: TransactionState,
    generation: u64,
}

/// What a deadline expiry did to its transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// One retry consumed; the transaction was re-armed and must be retransmitted.
    Retry(Transaction),
    /// No retries left; the transaction was removed.
    Exhausted(Transaction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deadline {
    at: Instant,
    key: TransactionKey,
    generation: u64,
}

impl Ord for Deadline {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Owns every live transaction and its deadline.
#[derive(Debug)]
pub struct TransactionTracker {
    live: HashMap<TransactionKey, Transaction>,
    deadlines: BinaryHeap<Deadline>,
    timeout: Duration,
    max_retries: u8,
    next_generation: u64,
}

impl TransactionTracker {
    pub fn new(timeout: Duration, max_retries: u8) -> Self {
        Self {
            live: HashMap::new(),
            deadlines: BinaryHeap::new(),
            timeout,
            max_retries,
            next_generation: 0,
        }
    }

    /// Open a transaction in `Sent(max_retries)` and arm its deadline.
    ///
    /// Fails with [`TelemetryError::DuplicateTransaction`] while the key is busy;
    /// the live transaction is never displaced.
    pub fn begin(
        &mut self,
        object: ObjectRef,
        all_instances: bool,
        is_request: bool,
        requires_ack: bool,
        now: Instant,
    ) -> Result<&Transaction> {
        let key = TransactionKey::for_object(&object, all_instances);
        if self.live.contains_key(&key) {
            return Err(TelemetryError::DuplicateTransaction(key));
        }
        let generation = self.bump_generation();
        let deadline = now + self.timeout;
        self.deadlines.push(Deadline {
            at: deadline,
            key,
            generation,
        });
        let transaction = self.live.entry(key).or_insert(Transaction {
            key,
            object,
            all_instances,
            is_request,
            requires_ack,
            retries_remaining: self.max_retries,
            attempts: 1,
            started_at: now,
            deadline,
            state: TransactionState::Sent {
                retries_remaining: self.max_retries,
            },
            generation,
        });
        Ok(transaction)
    }

    /// Ack received: remove the transaction and return it as acknowledged.
    pub fn resolve(&mut self, key: &TransactionKey) -> Option<Transaction> {
        let mut transaction = self.live.remove(key)?;
        transaction.state = TransactionState::Acknowledged;
        Some(transaction)
    }

    /// Terminate a transaction as failed without waiting for its deadline.
    pub fn fail(&mut self, key: &TransactionKey) -> Option<Transaction> {
        let mut transaction = self.live.remove(key)?;
        transaction.state = TransactionState::Failed;
        Some(transaction)
    }

    /// Keys whose live deadline has passed at `now`, earliest first.
    ///
    /// The heap is left untouched; [`TransactionTracker::on_timeout`] re-arms or
    /// removes each transaction, which retires its entry.
    pub fn due(&self, now: Instant) -> Vec<TransactionKey> {
        let mut due: Vec<&Deadline> = self
            .deadlines
            .iter()
            .filter(|deadline| deadline.at <= now && self.is_current(deadline))
            .collect();
        due.sort_by_key(|deadline| (deadline.at, deadline.generation));
        due.into_iter().map(|deadline| deadline.key).collect()
    }

    /// Apply an expiry to `key`. Ignores keys that are gone or not yet due.
    pub fn on_timeout(&mut self, key: &TransactionKey, now: Instant) -> Option<TimeoutOutcome> {
        let transaction = self.live.get(key)?;
        if transaction.deadline > now {
            return None;
        }
        if transaction.retries_remaining == 0 {
            let mut transaction = self.live.remove(key)?;
            transaction.state = TransactionState::Failed;
            return Some(TimeoutOutcome::Exhausted(transaction));
        }
        let generation = self.bump_generation();
        let deadline = now + self.timeout;
        let transaction = self.live.get_mut(key)?;
        transaction.retries_remaining -= 1;
        transaction.attempts += 1;
        transaction.deadline = deadline;
        transaction.generation = generation;
        transaction.state = TransactionState::Sent {
            retries_remaining: transaction.retries_remaining,
        };
        let snapshot = transaction.clone();
        self.deadlines.push(Deadline {
            at: deadline,
            key: *key,
            generation,
        });
        Some(TimeoutOutcome::Retry(snapshot))
    }

    /// Drop the transactions of one object instance (including its all-instance slot
    /// when the instance is the one that opened it).
    pub fn cancel(&mut self, object: &ObjectRef) -> Vec<Transaction> {
        self.remove_where(|transaction| transaction.object == *object)
    }

    pub fn cancel_type(&mut self, object_id: ObjectId) -> Vec<Transaction> {
        self.remove_where(|transaction| transaction.key.object_id == object_id)
    }

    /// Earliest pending deadline, skipping stale heap entries.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(deadline) = self.deadlines.peek() {
            if self.is_current(deadline) {
                return Some(deadline.at);
            }
            self.deadlines.pop();
        }
        None
    }

    pub fn get(&self, key: &TransactionKey) -> Option<&Transaction> {
        self.live.get(key)
    }

    pub fn contains(&self, key: &TransactionKey) -> bool {
        self.live.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn keys(&self) -> Vec<TransactionKey> {
        let mut keys: Vec<_> = self.live.keys().copied().collect();
        keys.sort();
        keys
    }

    fn is_current(&self, deadline: &Deadline) -> bool {
        self.live
            .get(&deadline.key)
            .is_some_and(|transaction| transaction.generation == deadline.generation)
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation = self.next_generation.wrapping_add(1);
        self.next_generation
    }

    fn remove_where(&mut self, matches: impl Fn(&Transaction) -> bool) -> Vec<Transaction> {
        let keys: Vec<TransactionKey> = self
            .live
            .values()
            .filter(|transaction| matches(transaction))
            .map(|transaction| transaction.key)
            .collect();
        keys.iter()
            .filter_map(|key| self.live.remove(key))
            .map(|mut transaction| {
                transaction.state = TransactionState::Failed;
                transaction
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(250);

    fn tracker() -> TransactionTracker {
        TransactionTracker::new(TIMEOUT, 2)
    }

    #[test]
    fn duplicate_key_is_rejected_without_displacing() {
        let mut tracker = tracker();
        let now = Instant::now();
        let object = ObjectRef::single(0x42);
        tracker.begin(object, false, false, true, now).expect("first");
        let err = tracker
            .begin(object, false, true, true, now + Duration::from_millis(10))
            .expect_err("second is rejected");
        assert!(matches!(err, TelemetryError::DuplicateTransaction(_)));

        let key = TransactionKey::for_object(&object, false);
        let live = tracker.get(&key).expect("original kept");
        assert!(!live.is_request);
        assert_eq!(live.started_at, now);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn all_instance_transactions_use_their_own_slot() {
        let mut tracker = tracker();
        let now = Instant::now();
        let object = ObjectRef::new(0x42, 3);
        tracker.begin(object, false, true, false, now).expect("instance");
        tracker.begin(object, true, true, false, now).expect("fan-out");
        assert_eq!(tracker.len(), 2);
        assert!(tracker.contains(&TransactionKey {
            object_id: ObjectId(0x42),
            instance_id: InstanceId::ALL,
        }));
    }

    #[test]
    fn resolved_transactions_never_time_out() {
        let mut tracker = tracker();
        let now = Instant::now();
        let object = ObjectRef::single(1);
        tracker.begin(object, false, false, true, now).expect("begin");
        let key = TransactionKey::for_object(&object, false);

        let resolved = tracker.resolve(&key).expect("resolved");
        assert_eq!(resolved.state, TransactionState::Acknowledged);
        assert!(tracker.due(now + TIMEOUT * 4).is_empty());
        assert_eq!(tracker.next_deadline(), None);
    }

    #[test]
    fn retries_then_exhausts() {
        let mut tracker = tracker();
        let start = Instant::now();
        let object = ObjectRef::single(1);
        tracker.begin(object, false, false, true, start).expect("begin");
        let key = TransactionKey::for_object(&object, false);

        let mut now = start;
        let mut retries = 0;
        let exhausted = loop {
            now = tracker.next_deadline().expect("armed");
            let due = tracker.due(now);
            assert_eq!(due, vec![key]);
            match tracker.on_timeout(&key, now).expect("live") {
                TimeoutOutcome::Retry(transaction) => {
                    retries += 1;
                    assert_eq!(transaction.retries_remaining, 2 - retries);
                }
                TimeoutOutcome::Exhausted(transaction) => break transaction,
            }
        };
        assert_eq!(retries, 2);
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(exhausted.state, TransactionState::Failed);
        assert_eq!(now, start + TIMEOUT * 3);
        assert!(tracker.is_empty());
    }

    #[test]
    fn timeout_rearms_once_per_deadline() {
        let mut tracker = tracker();
        let now = Instant::now();
        let object = ObjectRef::single(1);
        tracker.begin(object, false, false, true, now).expect("begin");
        let key = TransactionKey::for_object(&object, false);
        assert_eq!(tracker.due(now + TIMEOUT), vec![key]);
        assert!(matches!(
            tracker.on_timeout(&key, now + TIMEOUT),
            Some(TimeoutOutcome::Retry(_))
        ));
        assert!(tracker.due(now + TIMEOUT).is_empty());
        assert!(tracker.on_timeout(&key, now + TIMEOUT).is_none());
        assert_eq!(tracker.next_deadline(), Some(now + TIMEOUT * 2));
    }

    #[test]
    fn early_timeout_is_ignored() {
        let mut tracker = tracker();
        let now = Instant::now();
        let object = ObjectRef::single(1);
        tracker.begin(object, false, false, true, now).expect("begin");
        let key = TransactionKey::for_object(&object, false);
        assert!(tracker.on_timeout(&key, now + Duration::from_millis(10)).is_none());
        assert_eq!(tracker.get(&key).map(|t| t.retries_remaining), Some(2));
    }

    #[test]
    fn cancel_drops_entry_and_deadline() {
        let mut tracker = tracker();
        let now = Instant::now();
        let object = ObjectRef::new(9, 1);
        tracker.begin(object, false, false, true, now).expect("begin");
        tracker.begin(ObjectRef::new(9, 2), false, false, true, now).expect("begin");
        assert_eq!(tracker.cancel(&object).len(), 1);
        assert_eq!(tracker.due(now + TIMEOUT).len(), 1);
        assert_eq!(tracker.cancel_type(ObjectId(9)).len(), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn earliest_deadline_surfaces_first() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker
            .begin(ObjectRef::single(2), false, false, true, now + Duration::from_millis(50))
            .expect("late");
        tracker.begin(ObjectRef::single(1), false, false, true, now).expect("early");
        assert_eq!(tracker.next_deadline(), Some(now + TIMEOUT));
        let due = tracker.due(now + TIMEOUT + Duration::from_millis(50));
        assert_eq!(
            due.iter().map(|key| key.object_id.0).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }
}
