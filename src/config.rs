//! Executor configuration: enforcement tunables and output handling

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadFailed(String),

    #[error("Invalid config format: {0}")]
    InvalidFormat(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Sampling period of the polling enforcer (milliseconds)
    pub poll_interval_ms: u64,

    /// Wall-clock backstop as a multiple of the configured timeout
    pub wall_clock_multiplier: f64,

    /// Fraction of the CPU ceiling above which a simultaneous violation is
    /// attributed to time rather than memory
    pub cpu_attribution_threshold: f64,

    /// Apply RLIMIT_CPU before exec (POSIX)
    pub kernel_cpu_limit: bool,

    /// Apply RLIMIT_AS before exec (POSIX). Off by default: virtual address
    /// space overshoots resident memory for most runtimes.
    pub address_space_limit: bool,

    /// Signal the whole process group on engine-initiated kills (POSIX)
    pub kill_process_group: bool,

    /// Read size for stdout/stderr chunks (bytes)
    pub read_chunk_size: usize,

    /// Cap on collected output for `Executor::execute` (bytes)
    pub max_output_bytes: usize,

    /// How long `Executor::execute` waits for stream closure after the
    /// result arrived (milliseconds)
    pub drain_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 20,
            wall_clock_multiplier: 1.5,
            cpu_attribution_threshold: 0.9,
            kernel_cpu_limit: true,
            address_space_limit: false,
            kill_process_group: true,
            read_chunk_size: 8192,
            max_output_bytes: 16 * 1024 * 1024, // 16MB
            drain_timeout_ms: 250,
        }
    }
}

impl ExecutorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Load from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; `.json` is parsed as JSON, anything else as YAML
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(format!("{}: {}", path.display(), e)))?;

        debug!("Loading executor config from {}", path.display());

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_yaml(&text),
        }
    }

    /// Apply `PROCGUARD_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(
            field: &'static str,
            value: String,
        ) -> Result<T, ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                field,
                reason: e.to_string(),
            })
        }

        if let Some(v) = lookup("PROCGUARD_POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse("poll_interval_ms", v)?;
        }
        if let Some(v) = lookup("PROCGUARD_WALL_CLOCK_MULTIPLIER") {
            self.wall_clock_multiplier = parse("wall_clock_multiplier", v)?;
        }
        if let Some(v) = lookup("PROCGUARD_CPU_ATTRIBUTION_THRESHOLD") {
            self.cpu_attribution_threshold = parse("cpu_attribution_threshold", v)?;
        }
        if let Some(v) = lookup("PROCGUARD_KERNEL_CPU_LIMIT") {
            self.kernel_cpu_limit = parse("kernel_cpu_limit", v)?;
        }
        if let Some(v) = lookup("PROCGUARD_ADDRESS_SPACE_LIMIT") {
            self.address_space_limit = parse("address_space_limit", v)?;
        }
        if let Some(v) = lookup("PROCGUARD_MAX_OUTPUT_BYTES") {
            self.max_output_bytes = parse("max_output_bytes", v)?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject values the enforcer cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }

        if !(self.wall_clock_multiplier >= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "wall_clock_multiplier",
                reason: format!("{} < 1.0", self.wall_clock_multiplier),
            });
        }

        if !(self.cpu_attribution_threshold > 0.0 && self.cpu_attribution_threshold <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "cpu_attribution_threshold",
                reason: format!("{} not in (0, 1]", self.cpu_attribution_threshold),
            });
        }

        if self.read_chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "read_chunk_size",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}
