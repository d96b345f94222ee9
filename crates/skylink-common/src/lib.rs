//! ---
//! gcs_section: "01-core-functionality"
//! gcs_subsection: "module"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "Shared primitives and utilities for the telemetry link."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
//! Shared primitives for the SkyLink workspace.
//! This crate exposes configuration loading, tracing initialisation and the
//! millisecond time helpers consumed by the telemetry link.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{AppConfig, LinkConfig, LoadedAppConfig, LoggingConfig};
pub use logging::{init_tracing, LogFormat};
