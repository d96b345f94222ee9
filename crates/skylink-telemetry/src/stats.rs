//! ---
//! gcs_section: "02-telemetry-link"
//! gcs_subsection: "module"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "Link counters and the periodic statistics exchange."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skylink_common::time::elapsed_millis;

use crate::event::LinkStatus;

/// Cumulative link counters. Only [`StatsAggregator::reset`] lowers them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_object_bytes: u64,
    pub rx_object_bytes: u64,
    pub tx_objects: u64,
    pub rx_objects: u64,
    pub tx_errors: u64,
    pub rx_errors: u64,
    pub tx_retries: u64,
    pub queue_drops: u64,
}

impl LinkStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Interval snapshot exchanged with the peer.
///
/// Transmit counters cover the interval since the previous report; receive
/// counters are cumulative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsReport {
    pub generated_at: DateTime<Utc>,
    pub link_status: LinkStatus,
    pub interval_ms: u32,
    pub tx_bytes: u64,
    pub tx_objects: u64,
    pub tx_errors: u64,
    pub tx_retries: u64,
    pub rx_bytes: u64,
    pub rx_objects: u64,
    pub rx_errors: u64,
}

impl StatsReport {
    /// Transmit throughput over the report interval.
    pub fn tx_bytes_per_second(&self) -> u64 {
        if self.interval_ms == 0 {
            return 0;
        }
        self.tx_bytes * 1000 / u64::from(self.interval_ms)
    }
}

/// Local counters alongside the peer's most recent report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsView {
    pub local: LinkStats,
    pub peer: Option<StatsReport>,
}

#[derive(Debug, Clone, Copy, Default)]
struct IntervalCounters {
    tx_bytes: u64,
    tx_objects: u64,
    tx_errors: u64,
    tx_retries: u64,
}

#[derive(Debug)]
pub struct StatsAggregator {
    total: LinkStats,
    interval: IntervalCounters,
    interval_started: Instant,
    peer: Option<StatsReport>,
}

impl StatsAggregator {
    pub fn new(now: Instant) -> Self {
        Self {
            total: LinkStats::default(),
            interval: IntervalCounters::default(),
            interval_started: now,
            peer: None,
        }
    }

    /// One transmitted frame. `object_payload` is false for link-statistics frames.
    pub fn record_tx(&mut self, frame_bytes: usize, object_payload: bool) {
        let bytes = frame_bytes as u64;
        self.total.tx_bytes += bytes;
        self.interval.tx_bytes += bytes;
        if object_payload {
            self.total.tx_object_bytes += bytes;
            self.total.tx_objects += 1;
            self.interval.tx_objects += 1;
        }
    }

    pub fn record_rx(&mut self, bytes: usize) {
        let bytes = bytes as u64;
        self.total.rx_bytes += bytes;
        self.total.rx_object_bytes += bytes;
        self.total.rx_objects += 1;
    }

    /// A malformed inbound frame still consumed link bandwidth.
    pub fn record_rx_error(&mut self, bytes: usize) {
        self.total.rx_bytes += bytes as u64;
        self.total.rx_errors += 1;
    }

    pub fn record_retry(&mut self) {
        self.total.tx_retries += 1;
        self.interval.tx_retries += 1;
    }

    pub fn record_tx_error(&mut self) {
        self.total.tx_errors += 1;
        self.interval.tx_errors += 1;
    }

    /// Capacity drop; also counted as a transmit error.
    pub fn record_drop(&mut self) {
        self.total.queue_drops += 1;
        self.record_tx_error();
    }

    /// Snapshot the interval and start a new one.
    pub fn publish(&mut self, now: Instant, link_status: LinkStatus) -> StatsReport {
        let report = StatsReport {
            generated_at: Utc::now(),
            link_status,
            interval_ms: elapsed_millis(self.interval_started, now),
            tx_bytes: self.interval.tx_bytes,
            tx_objects: self.interval.tx_objects,
            tx_errors: self.interval.tx_errors,
            tx_retries: self.interval.tx_retries,
            rx_bytes: self.total.rx_bytes,
            rx_objects: self.total.rx_objects,
            rx_errors: self.total.rx_errors,
        };
        self.interval = IntervalCounters::default();
        self.interval_started = now;
        report
    }

    pub fn record_peer(&mut self, report: StatsReport) {
        self.peer = Some(report);
    }

    pub fn totals(&self) -> LinkStats {
        self.total
    }

    pub fn view(&self) -> StatsView {
        StatsView {
            local: self.total,
            peer: self.peer.clone(),
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.total.reset();
        self.interval = IntervalCounters::default();
        self.interval_started = now;
        self.peer = None;
    }
}
