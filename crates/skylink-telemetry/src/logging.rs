//! ---
//! gcs_section: "02-telemetry-link"
//! gcs_subsection: "module"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "Uniform debug records for link frames."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
use tracing::debug;

use crate::codec::OutboundFrame;

/// Direction of frame movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    /// First transmission of a frame.
    Outbound,
    /// Retransmission after an acknowledgment timeout.
    Retry,
}

/// Emit a structured log entry for frame activity.
pub fn log_frame(direction: FrameDirection, frame: &OutboundFrame, bytes: usize) {
    debug!(
        object_id = frame.object.object_id.0,
        instance_id = frame.object.instance_id.0,
        all_instances = frame.all_instances,
        kind = frame.kind(),
        bytes,
        direction = ?direction,
        "link frame"
    );
}
