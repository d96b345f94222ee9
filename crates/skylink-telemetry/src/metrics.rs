//! ---
//! gcs_section: "02-telemetry-link"
//! gcs_subsection: "module"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "Prometheus instrumentation for the telemetry link."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{self, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::queue::Lane;

/// Registry shared between the link and whatever exports it.
pub type SharedRegistry = Arc<Registry>;

/// Metrics published by the telemetry coordinator.
#[derive(Clone)]
pub struct LinkMetrics {
    registry: SharedRegistry,
    tx_objects_total: IntCounter,
    tx_retries_total: IntCounter,
    transactions_failed_total: IntCounter,
    queue_drops_total: IntCounterVec,
    live_transactions: IntGauge,
    transaction_latency_seconds: Histogram,
}

impl LinkMetrics {
    /// Register the link metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let tx_objects_total = IntCounter::with_opts(Opts::new(
            "skylink_tx_objects_total",
            "Object frames handed to the wire codec",
        ))?;
        registry.register(Box::new(tx_objects_total.clone()))?;

        let tx_retries_total = IntCounter::with_opts(Opts::new(
            "skylink_tx_retries_total",
            "Retransmissions after an acknowledgment timeout",
        ))?;
        registry.register(Box::new(tx_retries_total.clone()))?;

        let transactions_failed_total = IntCounter::with_opts(Opts::new(
            "skylink_transactions_failed_total",
            "Transactions that ended without a successful acknowledgment",
        ))?;
        registry.register(Box::new(transactions_failed_total.clone()))?;

        let queue_drops_total = IntCounterVec::new(
            Opts::new(
                "skylink_queue_drops_total",
                "Items discarded because their dispatch lane was full",
            ),
            &["lane"],
        )?;
        registry.register(Box::new(queue_drops_total.clone()))?;

        let live_transactions = IntGauge::with_opts(Opts::new(
            "skylink_live_transactions",
            "Transactions currently awaiting an acknowledgment",
        ))?;
        registry.register(Box::new(live_transactions.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "skylink_transaction_latency_seconds",
            "Time from first transmission to acknowledgment",
        )
        .buckets(prometheus::exponential_buckets(0.005, 2.0, 12)?);
        let transaction_latency_seconds = Histogram::with_opts(histogram_opts)?;
        registry.register(Box::new(transaction_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            tx_objects_total,
            tx_retries_total,
            transactions_failed_total,
            queue_drops_total,
            live_transactions,
            transaction_latency_seconds,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_tx_object(&self) {
        self.tx_objects_total.inc();
    }

    pub fn inc_retry(&self) {
        self.tx_retries_total.inc();
    }

    pub fn inc_failed(&self) {
        self.transactions_failed_total.inc();
    }

    pub fn record_drop(&self, lane: Lane) {
        self.queue_drops_total
            .with_label_values(&[lane.as_str()])
            .inc();
    }

    pub fn set_live_transactions(&self, live: usize) {
        self.live_transactions
            .set(i64::try_from(live).unwrap_or(i64::MAX));
    }

    /// Record how long an acknowledged transaction took to resolve.
    pub fn observe_latency(&self, duration: Duration) {
        self.transaction_latency_seconds
            .observe(duration.as_secs_f64());
    }
}

impl std::fmt::Debug for LinkMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkMetrics").finish_non_exhaustive()
    }
}
