//! ---
//! gcs_section: "02-telemetry-link"
//! gcs_subsection: "module"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "Telemetry link coordinator crate root."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
//! Reliable, bandwidth-bounded object synchronization over a lossy serial link.
//!
//! Registry and codec notifications enter as [`LinkEvent`]s, outcomes leave as
//! [`Notification`]s, and the byte-level framing sits behind [`WireCodec`].

pub mod codec;
pub mod event;
pub mod logging;
pub mod metrics;
pub mod object;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod stats;
pub mod telemetry;
pub mod transaction;

/// Shared result type for link operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("object {0} is not registered")]
    UnknownObject(ObjectRef),
    #[error("transaction {0} is already in flight")]
    DuplicateTransaction(TransactionKey),
    #[error("{lane:?} lane full, dropped update for {object}")]
    QueueOverflow { object: ObjectRef, lane: Lane },
    #[error("object {object} could not be synchronized")]
    TransactionFailed { object: ObjectRef },
}

pub use codec::{CodecError, FrameBody, LoopbackCodec, OutboundFrame, WireCodec};
pub use event::{EventKind, FailureReason, LinkEvent, LinkStatus, Notification, UpdateOrigin};
pub use logging::{log_frame, FrameDirection};
pub use metrics::{LinkMetrics, SharedRegistry};
pub use object::{
    InstanceId, ObjectHandle, ObjectId, ObjectMetadata, ObjectRef, ObjectTable, UpdateMode,
};
pub use queue::{DispatchQueue, EnqueueOutcome, Lane, QueueItem};
pub use runtime::{LinkHandle, LinkRuntime};
pub use scheduler::{ScheduleEntry, UpdateScheduler};
pub use stats::{LinkStats, StatsAggregator, StatsReport, StatsView};
pub use telemetry::Telemetry;
pub use transaction::{
    TimeoutOutcome, Transaction, TransactionKey, TransactionState, TransactionTracker,
};
