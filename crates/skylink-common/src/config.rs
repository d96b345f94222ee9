//! ---
//! gcs_section: "01-core-functionality"
//! gcs_subsection: "module"
//! gcs_type: "source"
//! gcs_scope: "code"
//! gcs_description: "Shared primitives and utilities for the telemetry link."
//! gcs_version: "v0.0.0-prealpha"
//! gcs_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_req_timeout() -> Duration {
    Duration::from_millis(250)
}

fn default_max_retries() -> u8 {
    2
}

fn default_max_queue_size() -> usize {
    20
}

fn default_min_update_period() -> Duration {
    Duration::from_millis(1)
}

fn default_max_update_period() -> Duration {
    Duration::from_millis(1000)
}

fn default_stats_interval() -> Duration {
    Duration::from_millis(5000)
}

fn default_stagger() -> bool {
    true
}

fn default_stats_object_id() -> u32 {
    0x299E_34E0
}

fn default_inbound_capacity() -> usize {
    256
}

fn default_start_connected() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Top-level configuration document for SkyLink processes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "SKYLINK_CONFIG";

    /// Load configuration from disk, respecting the `SKYLINK_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse and validate a single configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.link.validate()
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Tuning knobs for the telemetry link coordinator.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// How long an acknowledged send or request waits before retrying.
    #[serde(default = "default_req_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub req_timeout: Duration,
    /// Retransmissions allowed after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    /// Capacity of each dispatch lane.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_min_update_period")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_update_period: Duration,
    #[serde(default = "default_max_update_period")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_update_period: Duration,
    /// Cadence of the link statistics exchange with the peer.
    #[serde(default = "default_stats_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub stats_interval: Duration,
    /// Spread the first periodic update of each object over its period.
    #[serde(default = "default_stagger")]
    pub stagger_initial_updates: bool,
    /// Seed for the stagger RNG; entropy-seeded when absent.
    #[serde(default)]
    pub random_seed: Option<u64>,
    /// Object id of the statistics object exchanged with the peer.
    #[serde(default = "default_stats_object_id")]
    pub stats_object_id: u32,
    /// Bound of the inbound event channel feeding the runtime task.
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
    #[serde(default = "default_start_connected")]
    pub start_connected: bool,
}

impl LinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.req_timeout.is_zero() {
            return Err(anyhow!("link.req_timeout must be greater than zero"));
        }
        if self.max_queue_size == 0 {
            return Err(anyhow!("link.max_queue_size must be at least 1"));
        }
        if self.min_update_period.is_zero() {
            return Err(anyhow!("link.min_update_period must be at least 1ms"));
        }
        if self.min_update_period > self.max_update_period {
            return Err(anyhow!(
                "link.min_update_period ({}ms) exceeds link.max_update_period ({}ms)",
                self.min_update_period.as_millis(),
                self.max_update_period.as_millis()
            ));
        }
        if self.stats_interval.is_zero() {
            return Err(anyhow!("link.stats_interval must be greater than zero"));
        }
        if self.inbound_capacity == 0 {
            return Err(anyhow!("link.inbound_capacity must be at least 1"));
        }
        Ok(())
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            req_timeout: default_req_timeout(),
            max_retries: default_max_retries(),
            max_queue_size: default_max_queue_size(),
            min_update_period: default_min_update_period(),
            max_update_period: default_max_update_period(),
            stats_interval: default_stats_interval(),
            stagger_initial_updates: default_stagger(),
            random_seed: None,
            stats_object_id: default_stats_object_id(),
            inbound_capacity: default_inbound_capacity(),
            start_connected: default_start_connected(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Skip the rolling file layer and log to stdout only.
    #[serde(default)]
    pub stdout_only: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            stdout_only: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_link_constants() {
        let config = LinkConfig::default();
        assert_eq!(config.req_timeout, Duration::from_millis(250));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.max_queue_size, 20);
        assert_eq!(config.min_update_period, Duration::from_millis(1));
        assert_eq!(config.max_update_period, Duration::from_millis(1000));
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config: AppConfig = r#"
            [link]
            req_timeout = 400
            max_queue_size = 8
            random_seed = 7

            [logging]
            format = "structured-json"
            stdout_only = true
        "#
        .parse()
        .expect("config parses");
        assert_eq!(config.link.req_timeout, Duration::from_millis(400));
        assert_eq!(config.link.max_queue_size, 8);
        assert_eq!(config.link.random_seed, Some(7));
        assert_eq!(config.link.max_retries, 2);
        assert_eq!(config.logging.format, LogFormat::StructuredJson);
        assert!(config.logging.stdout_only);
    }

    #[test]
    fn rejects_inverted_update_period_bounds() {
        let err = r#"
            [link]
            min_update_period = 500
            max_update_period = 100
        "#
        .parse::<AppConfig>()
        .expect_err("inverted bounds rejected");
        assert!(err.to_string().contains("min_update_period"));
    }

    #[test]
    fn load_picks_first_existing_candidate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing.toml");
        let present = dir.path().join("skylink.toml");
        std::fs::write(&present, "[link]\nmax_retries = 4\n").expect("write config");

        let loaded = AppConfig::load_with_source(&[missing, present.clone()]).expect("load");
        assert_eq!(loaded.source, present);
        assert_eq!(loaded.config.link.max_retries, 4);
    }

    #[test]
    fn load_reports_inspected_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.toml");
        let err = AppConfig::load(&[missing]).expect_err("nothing to load");
        assert!(err.to_string().contains("nope.toml"));
    }
}
