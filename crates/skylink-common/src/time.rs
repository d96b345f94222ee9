//! ---
//! gcs_section: "01-core-functionality"
//! gcs_subsection: "module"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "Shared primitives and utilities for the telemetry link."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

/// Convert a duration into whole milliseconds, saturating at `u32::MAX`.
pub fn duration_to_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// Milliseconds elapsed between two instants, zero if `later` precedes `earlier`.
pub fn elapsed_millis(earlier: Instant, later: Instant) -> u32 {
    duration_to_millis(later.saturating_duration_since(earlier))
}
