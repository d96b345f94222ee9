//! ---
//! gcs_section: "02-telemetry-link"
//! gcs_subsection: "module"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "Coordinator serializing every link event behind one lock."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
//! The [`Telemetry`] coordinator owns the object table, update scheduler,
//! dispatch lanes, transaction tracker and statistics. Every mutation enters
//! through [`Telemetry::handle`]; after each event the queue is pumped until it
//! is empty or an acknowledged transaction has just been started.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use skylink_common::time::elapsed_millis;
use skylink_common::LinkConfig;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::codec::{CodecError, OutboundFrame, WireCodec};
use crate::event::{EventKind, FailureReason, LinkEvent, LinkStatus, Notification, UpdateOrigin};
use crate::logging::{log_frame, FrameDirection};
use crate::metrics::LinkMetrics;
use crate::object::{
    InstanceId, ObjectId, ObjectMetadata, ObjectRef, ObjectTable, ThrottleGate, UpdateMode,
};
use crate::queue::{DispatchQueue, EnqueueOutcome, Lane, QueueItem};
use crate::scheduler::UpdateScheduler;
use crate::stats::{LinkStats, StatsAggregator, StatsReport, StatsView};
use crate::transaction::{TimeoutOutcome, Transaction, TransactionKey, TransactionTracker};
use crate::{Result, TelemetryError};

const NOTIFICATION_CAPACITY: usize = 1024;

enum Dispatch {
    /// Keep draining.
    Continue,
    /// An acknowledged transaction went out; stop until the next event.
    Started,
}

struct Inner {
    objects: ObjectTable,
    scheduler: UpdateScheduler,
    queue: DispatchQueue,
    tracker: TransactionTracker,
    stats: StatsAggregator,
    /// Items parked behind a busy transaction slot, coalesced by event class.
    deferred: IndexMap<TransactionKey, Vec<QueueItem>>,
    /// Keys whose slot came free with items still parked; served before the lanes.
    released: VecDeque<TransactionKey>,
    link_status: LinkStatus,
    last_tick: Instant,
    stats_object: ObjectRef,
    last_report: Option<StatsReport>,
    codec: Arc<dyn WireCodec>,
    metrics: Option<LinkMetrics>,
    outbox: Vec<Notification>,
}

/// Single serialization point of the telemetry link.
pub struct Telemetry {
    inner: Mutex<Inner>,
    notifications: broadcast::Sender<Notification>,
}

impl Telemetry {
    pub fn new(config: &LinkConfig, codec: Arc<dyn WireCodec>, now: Instant) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let link_status = if config.start_connected {
            LinkStatus::Connected
        } else {
            LinkStatus::Disconnected
        };
        let inner = Inner {
            objects: ObjectTable::new(),
            scheduler: UpdateScheduler::new(config),
            queue: DispatchQueue::new(config.max_queue_size),
            tracker: TransactionTracker::new(config.req_timeout, config.max_retries),
            stats: StatsAggregator::new(now),
            deferred: IndexMap::new(),
            released: VecDeque::new(),
            link_status,
            last_tick: now,
            stats_object: ObjectRef::single(config.stats_object_id),
            last_report: None,
            codec,
            metrics: None,
            outbox: Vec::new(),
        };
        Self {
            inner: Mutex::new(inner),
            notifications,
        }
    }

    pub fn with_metrics(mut self, metrics: LinkMetrics) -> Self {
        self.inner.get_mut().metrics = Some(metrics);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Apply one inbound event, then pump the dispatch queue.
    ///
    /// Errors report outcomes that were already counted and notified
    /// (unknown objects, overflow drops, failed transactions); the link state
    /// stays consistent either way.
    pub fn handle(&self, event: LinkEvent, now: Instant) -> Result<()> {
        trace!(event = event.kind(), "link event");
        self.transact(now, |inner| inner.handle(event, now))
    }

    /// Queue an object event as if the registry had raised it.
    pub fn send(
        &self,
        object: ObjectRef,
        event: EventKind,
        all_instances: bool,
        now: Instant,
    ) -> Result<()> {
        self.transact(now, |inner| {
            inner.submit(QueueItem::new(object, event, all_instances))
        })
    }

    /// Pull an object (or every instance of its type) from the peer.
    pub fn request(&self, object: ObjectRef, all_instances: bool, now: Instant) -> Result<()> {
        self.send(object, EventKind::UpdateRequest, all_instances, now)
    }

    /// Timer events that are due at `now`, to be fed back through [`Telemetry::handle`].
    pub fn due_events(&self, now: Instant) -> Vec<LinkEvent> {
        let inner = self.inner.lock();
        let mut events = Vec::new();
        if now >= inner.scheduler_due_at() {
            events.push(LinkEvent::SchedulerTick);
        }
        events.extend(
            inner
                .tracker
                .due(now)
                .into_iter()
                .map(|key| LinkEvent::TransactionTimeout { key }),
        );
        events
    }

    /// Earliest instant at which a scheduler tick or transaction deadline is due.
    pub fn next_wakeup(&self) -> Instant {
        let mut inner = self.inner.lock();
        let tick = inner.scheduler_due_at();
        match inner.tracker.next_deadline() {
            Some(deadline) => tick.min(deadline),
            None => tick,
        }
    }

    pub fn stats(&self) -> LinkStats {
        self.inner.lock().stats.totals()
    }

    pub fn stats_view(&self) -> StatsView {
        self.inner.lock().stats.view()
    }

    pub fn reset_stats(&self, now: Instant) {
        self.inner.lock().stats.reset(now);
    }

    pub fn live_transactions(&self) -> Vec<TransactionKey> {
        self.inner.lock().tracker.keys()
    }

    pub fn transaction(&self, key: &TransactionKey) -> Option<Transaction> {
        self.inner.lock().tracker.get(key).cloned()
    }

    pub fn deferred(&self, key: &TransactionKey) -> Vec<QueueItem> {
        self.inner
            .lock()
            .deferred
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn queue_depth(&self, lane: Lane) -> usize {
        self.inner.lock().queue.len(lane)
    }

    pub fn link_status(&self) -> LinkStatus {
        self.inner.lock().link_status
    }

    pub fn is_registered(&self, object: &ObjectRef) -> bool {
        self.inner.lock().objects.contains(object)
    }

    fn transact<R>(&self, now: Instant, apply: impl FnOnce(&mut Inner) -> R) -> R {
        let (result, outbox) = {
            let mut inner = self.inner.lock();
            let result = apply(&mut *inner);
            inner.pump(now);
            inner.refresh_gauges();
            (result, std::mem::take(&mut inner.outbox))
        };
        for notification in outbox {
            // No subscribers is not an error.
            let _ = self.notifications.send(notification);
        }
        result
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

impl Inner {
    fn handle(&mut self, event: LinkEvent, now: Instant) -> Result<()> {
        match event {
            LinkEvent::ObjectRegistered { object, metadata } => {
                self.advance_scheduler(now);
                self.objects.set_metadata(object.object_id, metadata);
                self.objects.insert(object)?;
                self.schedule(object, &metadata);
                info!(
                    object_id = object.object_id.0,
                    instance_id = object.instance_id.0,
                    update_mode = ?metadata.update_mode,
                    update_period_ms = metadata.update_period_ms,
                    acknowledged = metadata.acknowledged,
                    "object registered"
                );
                Ok(())
            }
            LinkEvent::InstanceAdded { object } => {
                self.advance_scheduler(now);
                self.objects.insert(object)?;
                if let Some(metadata) = self.objects.metadata_for(object.object_id).copied() {
                    self.schedule(object, &metadata);
                }
                debug!(
                    object_id = object.object_id.0,
                    instance_id = object.instance_id.0,
                    "instance added"
                );
                Ok(())
            }
            LinkEvent::MetadataChanged {
                object_id,
                metadata,
            } => {
                if self.objects.metadata_for(object_id).is_none() {
                    return Err(TelemetryError::UnknownObject(ObjectRef {
                        object_id,
                        instance_id: InstanceId::SINGLE,
                    }));
                }
                self.advance_scheduler(now);
                self.objects.set_metadata(object_id, metadata);
                for object in self.objects.instances_of(object_id) {
                    self.schedule(object, &metadata);
                }
                debug!(
                    object_id = object_id.0,
                    update_mode = ?metadata.update_mode,
                    update_period_ms = metadata.update_period_ms,
                    "metadata changed"
                );
                Ok(())
            }
            LinkEvent::ObjectRemoved { object_id } => {
                self.remove_type(object_id);
                Ok(())
            }
            LinkEvent::InstanceRemoved { object } => {
                self.remove_instance(&object);
                Ok(())
            }
            LinkEvent::LocalUpdate { object, origin } => {
                let event = match origin {
                    UpdateOrigin::Auto => EventKind::Updated,
                    UpdateOrigin::Manual => EventKind::UpdatedManual,
                };
                self.submit(QueueItem::new(object, event, false))
            }
            LinkEvent::UpdateRequested {
                object,
                all_instances,
            } => self.submit(QueueItem::new(
                object,
                EventKind::UpdateRequest,
                all_instances,
            )),
            LinkEvent::Unpacked { object, bytes } => {
                self.on_unpacked(object, bytes, now);
                Ok(())
            }
            LinkEvent::TransactionCompleted { key, success } => {
                self.on_completed(key, success, now)
            }
            LinkEvent::FrameError { bytes } => {
                self.stats.record_rx_error(bytes);
                debug!(bytes, "discarded malformed inbound frame");
                Ok(())
            }
            LinkEvent::PeerStats(report) => {
                trace!(
                    peer_tx_bytes = report.tx_bytes,
                    peer_rx_errors = report.rx_errors,
                    "peer statistics received"
                );
                self.stats.record_peer(report);
                Ok(())
            }
            LinkEvent::SchedulerTick => {
                self.advance_scheduler(now);
                Ok(())
            }
            LinkEvent::TransactionTimeout { key } => self.on_timeout(key, now),
            LinkEvent::PublishStats => self.publish_stats(now),
            LinkEvent::ResetStats => {
                self.stats.reset(now);
                info!("link statistics reset");
                Ok(())
            }
            LinkEvent::LinkStatus(status) => {
                if status != self.link_status {
                    info!(status = ?status, "link status changed");
                    self.link_status = status;
                }
                Ok(())
            }
        }
    }

    fn scheduler_due_at(&self) -> Instant {
        self.last_tick + Duration::from_millis(u64::from(self.scheduler.next_tick_ms()))
    }

    /// Run the scheduler up to `now` and queue every periodic update that fell due.
    fn advance_scheduler(&mut self, now: Instant) {
        let elapsed_ms = elapsed_millis(self.last_tick, now);
        if elapsed_ms == 0 {
            return;
        }
        self.last_tick += Duration::from_millis(u64::from(elapsed_ms));
        for object in self.scheduler.tick(elapsed_ms) {
            let item = QueueItem::new(object, EventKind::UpdatedPeriodic, false);
            if matches!(self.admit(&item), Ok(true)) {
                self.enqueue(item);
            }
        }
    }

    fn schedule(&mut self, object: ObjectRef, metadata: &ObjectMetadata) {
        self.scheduler
            .register(object, metadata.schedule_period_ms());
    }

    /// Validate and queue an externally raised item.
    fn submit(&mut self, item: QueueItem) -> Result<()> {
        if !self.admit(&item)? {
            return Ok(());
        }
        match self.enqueue(item) {
            EnqueueOutcome::Queued { .. } => Ok(()),
            EnqueueOutcome::Dropped => Err(TelemetryError::QueueOverflow {
                object: item.object,
                lane: item.lane(),
            }),
        }
    }

    /// Metadata of a single instance through its arena handle, or of the type for fan-out items.
    fn metadata_of(&self, item: &QueueItem) -> Option<ObjectMetadata> {
        if item.all_instances {
            return self.objects.metadata_for(item.object.object_id).copied();
        }
        let handle = self.objects.handle(&item.object)?;
        self.objects.metadata(handle).copied()
    }

    /// Update-mode acceptance, applied before the item takes a lane slot.
    fn admit(&mut self, item: &QueueItem) -> Result<bool> {
        if item.object == self.stats_object {
            return Ok(true);
        }
        let metadata = self
            .metadata_of(item)
            .ok_or(TelemetryError::UnknownObject(item.object))?;
        let admitted = match (metadata.update_mode, item.event) {
            (_, EventKind::UpdateRequest | EventKind::Unpacked) => true,
            (UpdateMode::ThrottledPeriodic, event) => {
                self.admit_throttled(item.object.object_id, event)
            }
            (_, EventKind::UpdatedManual) => true,
            (UpdateMode::Manual, _) => false,
            (UpdateMode::Periodic, event) => event == EventKind::UpdatedPeriodic,
            (UpdateMode::OnChange, event) => event == EventKind::Updated,
        };
        if !admitted {
            trace!(
                object_id = item.object.object_id.0,
                instance_id = item.object.instance_id.0,
                event = item.event.as_str(),
                update_mode = ?metadata.update_mode,
                "event filtered by update mode"
            );
        }
        Ok(admitted)
    }

    fn admit_throttled(&mut self, object_id: ObjectId, event: EventKind) -> bool {
        let gate = self.objects.throttle(object_id).unwrap_or_default();
        let (next, admitted) = match (gate, event) {
            (_, EventKind::UpdatedManual)
            | (ThrottleGate::Open, EventKind::Updated)
            | (ThrottleGate::Holding { pending: true }, EventKind::UpdatedPeriodic) => {
                (ThrottleGate::Holding { pending: false }, true)
            }
            (ThrottleGate::Holding { .. }, EventKind::Updated) => {
                (ThrottleGate::Holding { pending: true }, false)
            }
            (ThrottleGate::Holding { pending: false }, EventKind::UpdatedPeriodic) => {
                (ThrottleGate::Open, false)
            }
            (gate, _) => (gate, false),
        };
        self.objects.set_throttle(object_id, next);
        admitted
    }

    fn enqueue(&mut self, item: QueueItem) -> EnqueueOutcome {
        let lane = item.lane();
        let outcome = self.queue.enqueue(item, lane);
        match outcome {
            EnqueueOutcome::Queued { depth } => {
                trace!(
                    object_id = item.object.object_id.0,
                    instance_id = item.object.instance_id.0,
                    event = item.event.as_str(),
                    lane = lane.as_str(),
                    depth,
                    "queued"
                );
            }
            EnqueueOutcome::Dropped => {
                self.stats.record_drop();
                if let Some(metrics) = &self.metrics {
                    metrics.record_drop(lane);
                }
                warn!(
                    object_id = item.object.object_id.0,
                    instance_id = item.object.instance_id.0,
                    event = item.event.as_str(),
                    lane = lane.as_str(),
                    capacity = self.queue.capacity(),
                    lane_drops = self.queue.dropped(lane),
                    "dispatch lane full, dropping update"
                );
                self.outbox.push(Notification::Dropped {
                    object: item.object,
                    lane,
                });
                self.outbox.push(Notification::Completed {
                    object: item.object,
                    success: false,
                });
            }
        }
        outcome
    }

    fn pump(&mut self, now: Instant) {
        if self.link_status == LinkStatus::Disconnected {
            for item in self.queue.clear_lane(Lane::Normal) {
                self.reject_link_down(item);
            }
        }
        while let Some(item) = self.next_released().or_else(|| self.queue.drain_one()) {
            if self.link_status == LinkStatus::Disconnected && item.object != self.stats_object {
                self.reject_link_down(item);
                continue;
            }
            if let Dispatch::Started = self.dispatch(item, now) {
                break;
            }
        }
    }

    fn reject_link_down(&mut self, item: QueueItem) {
        debug!(
            object_id = item.object.object_id.0,
            instance_id = item.object.instance_id.0,
            event = item.event.as_str(),
            "link down, rejecting update"
        );
        self.outbox.push(Notification::Failed {
            object: item.object,
            reason: FailureReason::LinkDown,
        });
        self.outbox.push(Notification::Completed {
            object: item.object,
            success: false,
        });
    }

    fn dispatch(&mut self, item: QueueItem, now: Instant) -> Dispatch {
        if item.object == self.stats_object {
            self.send_stats();
            return Dispatch::Continue;
        }
        if item.event == EventKind::Unpacked {
            return Dispatch::Continue;
        }
        let Some(metadata) = self.metadata_of(&item) else {
            trace!(
                object_id = item.object.object_id.0,
                instance_id = item.object.instance_id.0,
                "skipping item for unregistered object"
            );
            return Dispatch::Continue;
        };

        let is_request = item.event.is_request();
        if !is_request && !metadata.acknowledged {
            let frame = OutboundFrame::object(item.object, item.all_instances, false);
            let sent = self.transmit(&frame, FrameDirection::Outbound).is_ok();
            if !sent {
                self.outbox.push(Notification::Failed {
                    object: item.object,
                    reason: FailureReason::TransmitFailed,
                });
            }
            self.outbox.push(Notification::Completed {
                object: item.object,
                success: sent,
            });
            return Dispatch::Continue;
        }

        let key = TransactionKey::for_object(&item.object, item.all_instances);
        if let Err(err) = self.tracker.begin(
            item.object,
            item.all_instances,
            is_request,
            metadata.acknowledged,
            now,
        ) {
            trace!(error = %err, "transaction slot busy");
            self.defer(key, item);
            return Dispatch::Continue;
        }
        let frame = if is_request {
            OutboundFrame::request(item.object, item.all_instances)
        } else {
            OutboundFrame::object(item.object, item.all_instances, true)
        };
        // A failed first transmission keeps its deadline; the timeout path retries it.
        let _ = self.transmit(&frame, FrameDirection::Outbound);
        Dispatch::Started
    }

    /// Park an item until the transaction on `key` terminates.
    fn defer(&mut self, key: TransactionKey, item: QueueItem) {
        let parked = self.deferred.entry(key).or_default();
        let duplicate = parked
            .iter()
            .any(|queued| queued.event == item.event && queued.all_instances == item.all_instances);
        if !duplicate {
            parked.push(item);
        }
        trace!(
            object_id = key.object_id.0,
            instance_id = key.instance_id.0,
            event = item.event.as_str(),
            parked = parked.len(),
            "deferred behind live transaction"
        );
    }

    /// Mark `key` free so its parked items dispatch ahead of both lanes.
    fn release_deferred(&mut self, key: &TransactionKey) {
        if self.deferred.contains_key(key) && !self.released.contains(key) {
            self.released.push_back(*key);
        }
    }

    /// Next parked item whose slot is free. Items stay parked under their key
    /// until dispatched, so a release never grows a lane.
    fn next_released(&mut self) -> Option<QueueItem> {
        while let Some(key) = self.released.front().copied() {
            if self.tracker.contains(&key) {
                // Busy again; the next termination releases it.
                self.released.pop_front();
                continue;
            }
            let Some(items) = self.deferred.get_mut(&key) else {
                self.released.pop_front();
                continue;
            };
            if items.is_empty() {
                self.deferred.shift_remove(&key);
                self.released.pop_front();
                continue;
            }
            let item = items.remove(0);
            if items.is_empty() {
                self.deferred.shift_remove(&key);
                self.released.pop_front();
            }
            return Some(item);
        }
        None
    }

    fn transmit(
        &mut self,
        frame: &OutboundFrame,
        direction: FrameDirection,
    ) -> std::result::Result<usize, CodecError> {
        match self.codec.transmit(frame) {
            Ok(bytes) => {
                self.stats.record_tx(bytes, frame.is_object_payload());
                if frame.is_object_payload() {
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_tx_object();
                    }
                }
                log_frame(direction, frame, bytes);
                Ok(bytes)
            }
            Err(err) => {
                self.stats.record_tx_error();
                warn!(
                    object_id = frame.object.object_id.0,
                    instance_id = frame.object.instance_id.0,
                    codec = self.codec.name(),
                    error = %err,
                    "transmit failed"
                );
                Err(err)
            }
        }
    }

    fn send_stats(&mut self) {
        let Some(report) = self.last_report.clone() else {
            return;
        };
        let frame = OutboundFrame::stats(self.stats_object, report);
        if self.transmit(&frame, FrameDirection::Outbound).is_ok() {
            trace!("link statistics sent");
        }
    }

    fn publish_stats(&mut self, now: Instant) -> Result<()> {
        let report = self.stats.publish(now, self.link_status);
        debug!(
            tx_bytes = report.tx_bytes,
            tx_objects = report.tx_objects,
            tx_retries = report.tx_retries,
            tx_errors = report.tx_errors,
            interval_ms = report.interval_ms,
            "link statistics published"
        );
        self.last_report = Some(report.clone());
        self.outbox.push(Notification::StatsPublished(report));
        let item = QueueItem::new(self.stats_object, EventKind::Updated, false);
        match self.enqueue(item) {
            EnqueueOutcome::Queued { .. } => Ok(()),
            EnqueueOutcome::Dropped => Err(TelemetryError::QueueOverflow {
                object: item.object,
                lane: item.lane(),
            }),
        }
    }

    fn on_unpacked(&mut self, object: ObjectRef, bytes: usize, now: Instant) {
        self.stats.record_rx(bytes);
        let pending_request = [
            TransactionKey::for_object(&object, false),
            TransactionKey::for_object(&object, true),
        ]
        .into_iter()
        .find(|key| {
            self.tracker
                .get(key)
                .is_some_and(|transaction| transaction.is_request)
        });
        match pending_request {
            Some(key) => self.finish_success(key, now),
            None => {
                trace!(
                    object_id = object.object_id.0,
                    instance_id = object.instance_id.0,
                    bytes,
                    "unsolicited object update"
                );
                self.outbox.push(Notification::Received { object });
            }
        }
    }

    fn on_completed(&mut self, key: TransactionKey, success: bool, now: Instant) -> Result<()> {
        if success {
            if self.tracker.contains(&key) {
                self.finish_success(key, now);
            } else {
                debug!(
                    object_id = key.object_id.0,
                    instance_id = key.instance_id.0,
                    "ack without live transaction"
                );
            }
            return Ok(());
        }
        let Some(transaction) = self.tracker.fail(&key) else {
            debug!(
                object_id = key.object_id.0,
                instance_id = key.instance_id.0,
                "nack without live transaction"
            );
            return Ok(());
        };
        warn!(
            object_id = key.object_id.0,
            instance_id = key.instance_id.0,
            attempts = transaction.attempts,
            "peer rejected transaction"
        );
        self.fail_transaction(&transaction, FailureReason::Nacked);
        Err(TelemetryError::TransactionFailed {
            object: transaction.object,
        })
    }

    fn finish_success(&mut self, key: TransactionKey, now: Instant) {
        let Some(transaction) = self.tracker.resolve(&key) else {
            return;
        };
        if let Some(metrics) = &self.metrics {
            metrics.observe_latency(now.saturating_duration_since(transaction.started_at));
        }
        debug!(
            object_id = key.object_id.0,
            instance_id = key.instance_id.0,
            attempts = transaction.attempts,
            is_request = transaction.is_request,
            "transaction acknowledged"
        );
        self.outbox.push(Notification::Succeeded {
            object: transaction.object,
            is_request: transaction.is_request,
        });
        self.outbox.push(Notification::Completed {
            object: transaction.object,
            success: true,
        });
        self.release_deferred(&key);
    }

    fn on_timeout(&mut self, key: TransactionKey, now: Instant) -> Result<()> {
        match self.tracker.on_timeout(&key, now) {
            None => {
                trace!(
                    object_id = key.object_id.0,
                    instance_id = key.instance_id.0,
                    "stale timeout ignored"
                );
                Ok(())
            }
            Some(TimeoutOutcome::Retry(transaction)) => {
                self.stats.record_retry();
                if let Some(metrics) = &self.metrics {
                    metrics.inc_retry();
                }
                debug!(
                    object_id = key.object_id.0,
                    instance_id = key.instance_id.0,
                    retries_remaining = transaction.retries_remaining,
                    "acknowledgment timed out, retrying"
                );
                let frame = if transaction.is_request {
                    OutboundFrame::request(transaction.object, transaction.all_instances)
                } else {
                    OutboundFrame::object(
                        transaction.object,
                        transaction.all_instances,
                        transaction.requires_ack,
                    )
                };
                // Errors are counted in transmit; the re-armed deadline covers them.
                let _ = self.transmit(&frame, FrameDirection::Retry);
                Ok(())
            }
            Some(TimeoutOutcome::Exhausted(transaction)) => {
                self.stats.record_tx_error();
                self.codec.cancel(&transaction.object);
                warn!(
                    object_id = key.object_id.0,
                    instance_id = key.instance_id.0,
                    attempts = transaction.attempts,
                    "transaction failed after exhausting retries"
                );
                self.fail_transaction(&transaction, FailureReason::RetriesExhausted);
                Err(TelemetryError::TransactionFailed {
                    object: transaction.object,
                })
            }
        }
    }

    fn fail_transaction(&mut self, transaction: &Transaction, reason: FailureReason) {
        if reason == FailureReason::Nacked {
            self.stats.record_tx_error();
        }
        if let Some(metrics) = &self.metrics {
            metrics.inc_failed();
        }
        self.outbox.push(Notification::Failed {
            object: transaction.object,
            reason,
        });
        self.outbox.push(Notification::Completed {
            object: transaction.object,
            success: false,
        });
        self.release_deferred(&transaction.key);
    }

    fn remove_instance(&mut self, object: &ObjectRef) {
        self.scheduler.unregister(object);
        let purged = self.queue.purge(object);
        self.deferred.retain(|_, items| {
            items.retain(|item| item.object != *object);
            !items.is_empty()
        });
        let cancelled = self.tracker.cancel(object);
        self.drop_cancelled(&cancelled);
        self.objects.remove(object);
        info!(
            object_id = object.object_id.0,
            instance_id = object.instance_id.0,
            purged,
            cancelled = cancelled.len(),
            "instance removed"
        );
    }

    fn remove_type(&mut self, object_id: ObjectId) {
        self.scheduler.unregister_type(object_id);
        let purged = self.queue.purge_type(object_id);
        self.deferred.retain(|key, _| key.object_id != object_id);
        let cancelled = self.tracker.cancel_type(object_id);
        self.drop_cancelled(&cancelled);
        let instances = self.objects.remove_type(object_id);
        info!(
            object_id = object_id.0,
            instances = instances.len(),
            purged,
            cancelled = cancelled.len(),
            "object type removed"
        );
    }

    fn drop_cancelled(&mut self, cancelled: &[Transaction]) {
        for transaction in cancelled {
            self.codec.cancel(&transaction.object);
            self.outbox.push(Notification::Completed {
                object: transaction.object,
                success: false,
            });
            self.release_deferred(&transaction.key);
        }
    }

    fn refresh_gauges(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_live_transactions(self.tracker.len());
        }
    }
}
