//! ---
//! gcs_section: "02-telemetry-link"
//! gcs_subsection: "module"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "Inbound link events and outbound per-object notifications."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::object::{ObjectId, ObjectMetadata, ObjectRef};
use crate::queue::Lane;
use crate::stats::StatsReport;
use crate::transaction::TransactionKey;

/// Event classes carried by queue items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Remote data was unpacked into the local object.
    Unpacked,
    /// The local value changed.
    Updated,
    /// A user edited the object and asked for it to be sent.
    UpdatedManual,
    /// The scheduler fired the object's period.
    UpdatedPeriodic,
    /// Pull the object from the peer.
    UpdateRequest,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Unpacked => "unpacked",
            EventKind::Updated => "updated",
            EventKind::UpdatedManual => "updated_manual",
            EventKind::UpdatedPeriodic => "updated_periodic",
            EventKind::UpdateRequest => "update_request",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, EventKind::UpdateRequest)
    }
}

/// Where a local value change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOrigin {
    /// Programmatic change of the data structure.
    Auto,
    /// Explicit user action.
    Manual,
}

/// Connection state of the link as reported by the statistics handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Disconnected,
    #[default]
    Connected,
}

/// Every input the coordinator serializes.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A new object type, optionally with its first instance.
    ObjectRegistered {
        object: ObjectRef,
        metadata: ObjectMetadata,
    },
    /// Another instance of an already registered type.
    InstanceAdded { object: ObjectRef },
    MetadataChanged {
        object_id: ObjectId,
        metadata: ObjectMetadata,
    },
    ObjectRemoved { object_id: ObjectId },
    InstanceRemoved { object: ObjectRef },
    LocalUpdate {
        object: ObjectRef,
        origin: UpdateOrigin,
    },
    UpdateRequested {
        object: ObjectRef,
        all_instances: bool,
    },
    /// The codec unpacked a frame for this object.
    Unpacked { object: ObjectRef, bytes: usize },
    /// The codec saw an ack (`success`) or nack for a transaction.
    TransactionCompleted { key: TransactionKey, success: bool },
    /// The codec discarded a malformed inbound frame.
    FrameError { bytes: usize },
    /// The peer's statistics object arrived.
    PeerStats(StatsReport),
    SchedulerTick,
    TransactionTimeout { key: TransactionKey },
    PublishStats,
    ResetStats,
    LinkStatus(LinkStatus),
}

impl LinkEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LinkEvent::ObjectRegistered { .. } => "object_registered",
            LinkEvent::InstanceAdded { .. } => "instance_added",
            LinkEvent::MetadataChanged { .. } => "metadata_changed",
            LinkEvent::ObjectRemoved { .. } => "object_removed",
            LinkEvent::InstanceRemoved { .. } => "instance_removed",
            LinkEvent::LocalUpdate { .. } => "local_update",
            LinkEvent::UpdateRequested { .. } => "update_requested",
            LinkEvent::Unpacked { .. } => "unpacked",
            LinkEvent::TransactionCompleted { .. } => "transaction_completed",
            LinkEvent::FrameError { .. } => "frame_error",
            LinkEvent::PeerStats(_) => "peer_stats",
            LinkEvent::SchedulerTick => "scheduler_tick",
            LinkEvent::TransactionTimeout { .. } => "transaction_timeout",
            LinkEvent::PublishStats => "publish_stats",
            LinkEvent::ResetStats => "reset_stats",
            LinkEvent::LinkStatus(_) => "link_status",
        }
    }
}

/// Why an object could not be synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Every retry timed out.
    RetriesExhausted,
    /// The peer rejected the transaction.
    Nacked,
    /// The codec could not transmit an unacknowledged frame.
    TransmitFailed,
    /// Only link statistics may pass while disconnected.
    LinkDown,
}

/// Outcomes published to registry, UI, and logging consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// An acknowledged send or request resolved.
    Succeeded { object: ObjectRef, is_request: bool },
    Failed {
        object: ObjectRef,
        reason: FailureReason,
    },
    /// Terminal outcome of anything submitted for this object.
    Completed { object: ObjectRef, success: bool },
    /// Unsolicited data from the peer.
    Received { object: ObjectRef },
    Dropped { object: ObjectRef, lane: Lane },
    StatsPublished(StatsReport),
}
