//! ---
//! gcs_section: "02-telemetry-link"
//! gcs_subsection: "integration-tests"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "End-to-end link behaviour against the loopback codec."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use prometheus::Registry;
use skylink_common::LinkConfig;
use skylink_telemetry::{
    FailureReason, FrameBody, InstanceId, Lane, LinkEvent, LinkMetrics, LinkRuntime,
    LoopbackCodec, Notification, ObjectId, ObjectMetadata, ObjectRef, Telemetry, TransactionKey,
    UpdateOrigin,
};
use tokio::sync::broadcast;

struct Link {
    telemetry: Arc<Telemetry>,
    codec: LoopbackCodec,
    start: Instant,
}

impl Link {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: LinkConfig) -> Self {
        let codec = LoopbackCodec::new();
        let start = Instant::now();
        let telemetry = Arc::new(Telemetry::new(&config, Arc::new(codec.clone()), start));
        Self {
            telemetry,
            codec,
            start,
        }
    }

    fn at(&self, ms: u64) -> Instant {
        self.start + Duration::from_millis(ms)
    }

    fn register(&self, object: ObjectRef, metadata: ObjectMetadata) {
        self.telemetry
            .handle(LinkEvent::ObjectRegistered { object, metadata }, self.start)
            .expect("register object");
    }

    fn event(&self, event: LinkEvent, ms: u64) -> skylink_telemetry::Result<()> {
        self.telemetry.handle(event, self.at(ms))
    }

    /// Fire every timer due up to `end_ms`; returns the wake-up offsets that ran.
    fn run_timers(&self, end_ms: u64) -> Vec<u64> {
        let end = self.at(end_ms);
        let mut wakeups = Vec::new();
        loop {
            let wakeup = self.telemetry.next_wakeup();
            if wakeup > end {
                break;
            }
            wakeups.push(wakeup.duration_since(self.start).as_millis() as u64);
            for event in self.telemetry.due_events(wakeup) {
                let _ = self.telemetry.handle(event, wakeup);
            }
        }
        wakeups
    }
}

fn test_config() -> LinkConfig {
    LinkConfig {
        stagger_initial_updates: false,
        random_seed: Some(11),
        ..LinkConfig::default()
    }
}

fn drain(receiver: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    std::iter::from_fn(|| receiver.try_recv().ok()).collect()
}

#[test]
fn periodic_unacknowledged_object_sends_once_per_period() {
    let link = Link::new();
    let object = ObjectRef::single(0xA0);
    link.register(object, ObjectMetadata::periodic(100));

    let wakeups = link.run_timers(350);
    assert_eq!(wakeups, vec![100, 200, 300]);
    let frames = link.codec.frames_for(&object);
    assert_eq!(frames.len(), 3);
    assert!(frames
        .iter()
        .all(|frame| frame.body == FrameBody::Object { acked: false }));
    assert!(link.telemetry.live_transactions().is_empty());
}

#[test]
fn unanswered_acknowledged_send_retries_then_fails() {
    let link = Link::new();
    let mut notes = link.telemetry.subscribe();
    let object = ObjectRef::single(0xB0);
    link.register(object, ObjectMetadata::manual().with_ack(true));

    link.event(
        LinkEvent::LocalUpdate {
            object,
            origin: UpdateOrigin::Manual,
        },
        0,
    )
    .expect("send");

    let mut send_times = vec![0];
    let mut failed_at = None;
    let end = link.at(900);
    loop {
        let wakeup = link.telemetry.next_wakeup();
        if wakeup > end {
            break;
        }
        let before = link.codec.frames_for(&object).len();
        for event in link.telemetry.due_events(wakeup) {
            let _ = link.telemetry.handle(event, wakeup);
        }
        let offset = wakeup.duration_since(link.start).as_millis() as u64;
        if link.codec.frames_for(&object).len() > before {
            send_times.push(offset);
        }
        if drain(&mut notes).contains(&Notification::Failed {
            object,
            reason: FailureReason::RetriesExhausted,
        }) {
            failed_at = Some(offset);
        }
    }

    assert_eq!(send_times, vec![0, 250, 500]);
    assert_eq!(failed_at, Some(750));
    assert!(link.telemetry.live_transactions().is_empty());
    assert_eq!(link.codec.cancelled(), vec![object]);

    let stats = link.telemetry.stats();
    assert_eq!(stats.tx_retries, 2);
    assert_eq!(stats.tx_errors, 1);
    assert_eq!(stats.tx_objects, 3);
}

#[test]
fn full_normal_lane_drops_newest_and_keeps_fifo_order() {
    let link = Link::new();
    let mut notes = link.telemetry.subscribe();
    let objects: Vec<ObjectRef> = (0..25).map(|id| ObjectRef::single(0x100 + id)).collect();
    for object in &objects {
        link.register(*object, ObjectMetadata::periodic(100).with_ack(true));
    }

    link.event(LinkEvent::SchedulerTick, 100).expect("tick");
    let dropped: Vec<ObjectRef> = drain(&mut notes)
        .into_iter()
        .filter_map(|note| match note {
            Notification::Dropped { object, lane } => {
                assert_eq!(lane, Lane::Normal);
                Some(object)
            }
            _ => None,
        })
        .collect();
    assert_eq!(dropped, objects[20..].to_vec());
    assert_eq!(link.telemetry.stats().queue_drops, 5);
    assert_eq!(link.telemetry.queue_depth(Lane::Normal), 19);

    for step in 0..20u64 {
        let key = link.telemetry.live_transactions()[0];
        link.event(LinkEvent::TransactionCompleted { key, success: true }, 101 + step)
            .expect("ack");
    }
    let sent: Vec<ObjectRef> = link
        .codec
        .frames()
        .iter()
        .map(|frame| frame.object)
        .collect();
    assert_eq!(sent, objects[..20].to_vec());
    assert!(link.telemetry.live_transactions().is_empty());
}

#[test]
fn back_to_back_requests_share_one_transaction() {
    let link = Link::new();
    let object = ObjectRef::single(0xD0);
    link.register(object, ObjectMetadata::manual().with_ack(true));
    let key = TransactionKey::for_object(&object, false);

    link.telemetry.request(object, false, link.at(0)).expect("first");
    link.telemetry.request(object, false, link.at(1)).expect("second");
    assert_eq!(link.telemetry.live_transactions(), vec![key]);
    assert_eq!(link.telemetry.deferred(&key).len(), 1);
    assert_eq!(link.codec.frames().len(), 1);

    link.event(LinkEvent::Unpacked { object, bytes: 24 }, 50)
        .expect("first reply");
    assert_eq!(link.telemetry.live_transactions(), vec![key]);
    assert!(link.telemetry.deferred(&key).is_empty());
    assert_eq!(link.codec.frames().len(), 2);

    link.event(LinkEvent::Unpacked { object, bytes: 24 }, 90)
        .expect("second reply");
    assert!(link.telemetry.live_transactions().is_empty());
    assert_eq!(link.telemetry.stats().queue_drops, 0);
}

#[test]
fn releasing_deferred_items_keeps_lanes_within_capacity() {
    let link = Link::with_config(LinkConfig {
        max_queue_size: 1,
        ..test_config()
    });
    let mut notes = link.telemetry.subscribe();
    let object = ObjectRef::single(0xC0);
    let bystander = ObjectRef::single(0xC1);
    link.register(object, ObjectMetadata::on_change().with_ack(true));
    link.register(bystander, ObjectMetadata::on_change().with_ack(true));
    let key = TransactionKey::for_object(&object, false);
    let bystander_key = TransactionKey::for_object(&bystander, false);

    let within_capacity = |link: &Link| {
        assert!(link.telemetry.queue_depth(Lane::Priority) <= 1);
        assert!(link.telemetry.queue_depth(Lane::Normal) <= 1);
    };

    for (ms, origin) in [
        (0, UpdateOrigin::Auto),
        (1, UpdateOrigin::Auto),
        (2, UpdateOrigin::Manual),
    ] {
        link.event(LinkEvent::LocalUpdate { object, origin }, ms)
            .expect("update");
        within_capacity(&link);
    }
    link.telemetry.request(object, false, link.at(3)).expect("request");
    assert_eq!(link.telemetry.deferred(&key).len(), 3);

    link.event(
        LinkEvent::LocalUpdate {
            object: bystander,
            origin: UpdateOrigin::Auto,
        },
        4,
    )
    .expect("bystander");
    assert_eq!(link.telemetry.live_transactions(), vec![key, bystander_key]);

    for step in 0..4u64 {
        link.event(LinkEvent::TransactionCompleted { key, success: true }, 10 + step)
            .expect("ack");
        within_capacity(&link);
    }

    let bodies: Vec<FrameBody> = link
        .codec
        .frames_for(&object)
        .into_iter()
        .map(|frame| frame.body)
        .collect();
    assert_eq!(
        bodies,
        vec![
            FrameBody::Object { acked: true },
            FrameBody::Object { acked: true },
            FrameBody::Object { acked: true },
            FrameBody::Request,
        ]
    );
    assert!(link.telemetry.deferred(&key).is_empty());
    assert_eq!(link.telemetry.live_transactions(), vec![bystander_key]);
    assert_eq!(link.telemetry.stats().queue_drops, 0);
    assert!(!drain(&mut notes)
        .iter()
        .any(|note| matches!(note, Notification::Dropped { .. })));
}

#[test]
fn ack_before_deadline_never_times_out() {
    let link = Link::new();
    let object = ObjectRef::single(0xE0);
    link.register(object, ObjectMetadata::on_change().with_ack(true));
    link.event(
        LinkEvent::LocalUpdate {
            object,
            origin: UpdateOrigin::Auto,
        },
        0,
    )
    .expect("send");
    let key = TransactionKey::for_object(&object, false);
    link.event(LinkEvent::TransactionCompleted { key, success: true }, 249)
        .expect("ack");

    link.run_timers(2000);
    assert_eq!(link.codec.frames().len(), 1);
    assert_eq!(link.telemetry.stats().tx_retries, 0);
    assert_eq!(link.telemetry.stats().tx_errors, 0);
}

#[test]
fn removing_an_object_cancels_everything_for_it() {
    let link = Link::new();
    let mut notes = link.telemetry.subscribe();
    let object = ObjectRef::single(0xF0);
    link.register(object, ObjectMetadata::periodic(100).with_ack(true));

    link.event(
        LinkEvent::LocalUpdate {
            object,
            origin: UpdateOrigin::Manual,
        },
        0,
    )
    .expect("send");
    link.telemetry.request(object, false, link.at(1)).expect("deferred");
    let key = TransactionKey::for_object(&object, false);
    assert_eq!(link.telemetry.deferred(&key).len(), 1);

    link.event(
        LinkEvent::ObjectRemoved {
            object_id: object.object_id,
        },
        10,
    )
    .expect("remove");
    assert!(link.telemetry.live_transactions().is_empty());
    assert!(link.telemetry.deferred(&key).is_empty());
    assert!(!link.telemetry.is_registered(&object));
    assert!(drain(&mut notes).contains(&Notification::Completed {
        object,
        success: false
    }));

    link.run_timers(1500);
    assert_eq!(link.codec.frames().len(), 1);
    assert_eq!(link.telemetry.stats().tx_retries, 0);
}

#[test]
fn all_instance_request_resolves_on_any_instance_reply() {
    let link = Link::new();
    let metadata = ObjectMetadata::manual().with_multi_instance(true);
    link.register(ObjectRef::new(0x70, 0), metadata);
    for instance in 1..4 {
        link.event(
            LinkEvent::InstanceAdded {
                object: ObjectRef::new(0x70, instance),
            },
            0,
        )
        .expect("instance");
    }

    link.telemetry
        .request(ObjectRef::new(0x70, 0), true, link.at(1))
        .expect("fan-out request");
    let key = TransactionKey {
        object_id: ObjectId(0x70),
        instance_id: InstanceId::ALL,
    };
    assert_eq!(link.telemetry.live_transactions(), vec![key]);
    assert!(link.codec.frames()[0].all_instances);

    link.event(
        LinkEvent::Unpacked {
            object: ObjectRef::new(0x70, 2),
            bytes: 16,
        },
        30,
    )
    .expect("reply");
    assert!(link.telemetry.live_transactions().is_empty());
}

#[test]
fn statistics_are_exchanged_with_the_peer() {
    let link = Link::new();
    let mut notes = link.telemetry.subscribe();
    let object = ObjectRef::single(0x11);
    link.register(object, ObjectMetadata::on_change());
    link.event(
        LinkEvent::LocalUpdate {
            object,
            origin: UpdateOrigin::Auto,
        },
        10,
    )
    .expect("send");

    link.event(LinkEvent::PublishStats, 5000).expect("publish");
    let report = drain(&mut notes)
        .into_iter()
        .find_map(|note| match note {
            Notification::StatsPublished(report) => Some(report),
            _ => None,
        })
        .expect("stats published");
    assert_eq!(report.tx_objects, 1);
    assert_eq!(report.interval_ms, 5000);

    let frames = link.codec.frames();
    assert!(matches!(
        frames.last().map(|frame| &frame.body),
        Some(FrameBody::Stats(sent)) if *sent == report
    ));
    // The stats frame itself is not object traffic.
    assert_eq!(link.telemetry.stats().tx_objects, 1);

    link.event(LinkEvent::PeerStats(report.clone()), 5010)
        .expect("peer stats");
    let view = link.telemetry.stats_view();
    assert_eq!(view.peer, Some(report));

    let json = serde_json::to_value(&view).expect("serialize view");
    assert_eq!(json["local"]["tx_objects"], 1);
    assert_eq!(json["peer"]["link_status"], "connected");

    link.telemetry.reset_stats(link.at(6000));
    assert_eq!(link.telemetry.stats().tx_bytes, 0);
}

#[test]
fn metrics_follow_link_activity() {
    let registry = Arc::new(Registry::new());
    let metrics = LinkMetrics::new(registry.clone()).expect("metrics");
    let codec = LoopbackCodec::new();
    let start = Instant::now();
    let telemetry =
        Telemetry::new(&test_config(), Arc::new(codec.clone()), start).with_metrics(metrics);

    let object = ObjectRef::single(0x12);
    telemetry
        .handle(
            LinkEvent::ObjectRegistered {
                object,
                metadata: ObjectMetadata::manual().with_ack(true),
            },
            start,
        )
        .expect("register");
    telemetry
        .handle(
            LinkEvent::LocalUpdate {
                object,
                origin: UpdateOrigin::Manual,
            },
            start,
        )
        .expect("send");
    let at = start + Duration::from_millis(250);
    for event in telemetry.due_events(at) {
        telemetry.handle(event, at).expect("retry");
    }

    let counter = |name: &str| {
        registry
            .gather()
            .iter()
            .find(|family| family.get_name() == name)
            .map(|family| family.get_metric()[0].get_counter().get_value())
    };
    assert_eq!(counter("skylink_tx_objects_total"), Some(2.0));
    assert_eq!(counter("skylink_tx_retries_total"), Some(1.0));
    let live = registry
        .gather()
        .iter()
        .find(|family| family.get_name() == "skylink_live_transactions")
        .map(|family| family.get_metric()[0].get_gauge().get_value());
    assert_eq!(live, Some(1.0));
}

#[tokio::test(start_paused = true)]
async fn runtime_drives_periodic_updates() {
    let config = test_config();
    let codec = LoopbackCodec::new();
    let telemetry = Arc::new(Telemetry::new(
        &config,
        Arc::new(codec.clone()),
        tokio::time::Instant::now().into_std(),
    ));
    let handle = LinkRuntime::spawn(telemetry, &config);
    let object = ObjectRef::single(0x21);
    handle
        .sender()
        .send(LinkEvent::ObjectRegistered {
            object,
            metadata: ObjectMetadata::periodic(100),
        })
        .await
        .expect("register");

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(codec.frames_for(&object).len(), 3);
    assert_eq!(handle.stats().tx_objects, 3);
    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn runtime_reports_exhausted_transactions_and_stats() {
    let config = LinkConfig {
        stats_interval: Duration::from_millis(400),
        ..test_config()
    };
    let codec = LoopbackCodec::new();
    let telemetry = Arc::new(Telemetry::new(
        &config,
        Arc::new(codec.clone()),
        tokio::time::Instant::now().into_std(),
    ));
    let handle = LinkRuntime::spawn(telemetry, &config);
    let mut notes = handle.subscribe();
    let object = ObjectRef::single(0x22);
    let sender = handle.sender();
    sender
        .send(LinkEvent::ObjectRegistered {
            object,
            metadata: ObjectMetadata::manual().with_ack(true),
        })
        .await
        .expect("register");
    sender
        .send(LinkEvent::LocalUpdate {
            object,
            origin: UpdateOrigin::Manual,
        })
        .await
        .expect("update");

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(codec.frames_for(&object).len(), 3);

    let notes = drain(&mut notes);
    assert!(notes.contains(&Notification::Failed {
        object,
        reason: FailureReason::RetriesExhausted,
    }));
    let published = notes
        .iter()
        .filter(|note| matches!(note, Notification::StatsPublished(_)))
        .count();
    assert_eq!(published, 2);
    handle.shutdown().await.expect("shutdown");
}
