//! ---
//! gcs_section: "02-telemetry-link"
//! gcs_subsection: "module"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "Tokio task driving the coordinator from events and timers."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use skylink_common::LinkConfig;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::event::{LinkEvent, Notification};
use crate::stats::LinkStats;
use crate::telemetry::Telemetry;

/// Spawns the task that owns the inbound event channel.
#[derive(Debug)]
pub struct LinkRuntime;

impl LinkRuntime {
    /// Must be called from within a tokio runtime.
    pub fn spawn(telemetry: Arc<Telemetry>, config: &LinkConfig) -> LinkHandle {
        let (events_tx, events_rx) = mpsc::channel(config.inbound_capacity);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(run_link(
            telemetry.clone(),
            events_rx,
            shutdown_rx,
            config.stats_interval,
        ));
        LinkHandle {
            telemetry,
            events: events_tx,
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Control surface for a spawned link task.
#[derive(Debug)]
pub struct LinkHandle {
    telemetry: Arc<Telemetry>,
    events: mpsc::Sender<LinkEvent>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    /// Producer side for registry and codec events.
    pub fn sender(&self) -> mpsc::Sender<LinkEvent> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.telemetry.subscribe()
    }

    pub fn stats(&self) -> LinkStats {
        self.telemetry.stats()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task
            .await
            .map_err(|err| anyhow!("link task join failure: {}", err))?;
        info!("telemetry link shutdown complete");
        Ok(())
    }
}

async fn run_link(
    telemetry: Arc<Telemetry>,
    mut events: mpsc::Receiver<LinkEvent>,
    mut shutdown: broadcast::Receiver<()>,
    stats_interval: Duration,
) {
    let mut stats_timer = tokio::time::interval_at(Instant::now() + stats_interval, stats_interval);
    stats_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        stats_interval_ms = stats_interval.as_millis() as u64,
        "telemetry link started"
    );

    loop {
        let wakeup = Instant::from_std(telemetry.next_wakeup());
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("link shutdown signal received");
                break;
            }
            event = events.recv() => match event {
                Some(event) => apply(&telemetry, event, Instant::now()),
                None => {
                    debug!("inbound event channel closed");
                    break;
                }
            },
            _ = tokio::time::sleep_until(wakeup) => {
                let now = Instant::now();
                for event in telemetry.due_events(now.into_std()) {
                    apply(&telemetry, event, now);
                }
            }
            _ = stats_timer.tick() => {
                apply(&telemetry, LinkEvent::PublishStats, Instant::now());
            }
        }
    }
}

fn apply(telemetry: &Telemetry, event: LinkEvent, now: Instant) {
    let kind = event.kind();
    if let Err(err) = telemetry.handle(event, now.into_std()) {
        warn!(event = kind, error = %err, "link event reported an error");
    }
}
