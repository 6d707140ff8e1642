//! Configuration management with TOML support
//!
//! Configuration is split into sections mirroring the crate's parts. Every
//! field has a default, so an empty TOML file (or no file at all) yields a
//! working setup. Environment variables with the `VARBEAM_` prefix override
//! file values, which lets embedding applications tune the pipeline without
//! shipping a config file.
//!
//! # Example
//!
//! ```rust
//! use varbeam::config::Config;
//!
//! let config = Config::default();
//! assert_eq!(config.runner.events_buffer_size, 256);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Query runner settings
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Query request settings
    #[serde(default)]
    pub query: QueryConfig,

    /// Logging settings consumed by embedding applications
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Query runner configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Buffer size of the shared result broadcast channel
    #[serde(default = "default_events_buffer_size")]
    pub events_buffer_size: usize,

    /// In-flight run count that triggers a warning log (0 = disabled)
    #[serde(default)]
    pub inflight_warn_threshold: usize,
}

/// Query request configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Span of the fallback time range, in hours
    #[serde(default = "default_time_span_hours")]
    pub default_time_span_hours: i64,

    /// Application tag attached to outgoing query requests
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable structured logging
    #[serde(default = "default_true")]
    pub structured_logging: bool,
}

// Default value functions
fn default_events_buffer_size() -> usize {
    256
}
fn default_time_span_hours() -> i64 {
    6
}
fn default_app_name() -> String {
    "varbeam".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            events_buffer_size: default_events_buffer_size(),
            inflight_warn_threshold: 0,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_time_span_hours: default_time_span_hours(),
            app_name: default_app_name(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: true,
        }
    }
}

impl RunnerConfig {
    /// Set the result broadcast buffer size
    pub fn with_events_buffer_size(mut self, size: usize) -> Self {
        self.events_buffer_size = size;
        self
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {}: {}", path, e))
        })?;

        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!("Failed to parse config file {}: {}", path, e))
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("VARBEAM_EVENTS_BUFFER_SIZE") {
            if let Ok(size) = size.parse() {
                self.runner.events_buffer_size = size;
            }
        }
        if let Ok(hours) = std::env::var("VARBEAM_DEFAULT_TIME_SPAN_HOURS") {
            if let Ok(hours) = hours.parse() {
                self.query.default_time_span_hours = hours;
            }
        }
        if let Ok(app) = std::env::var("VARBEAM_APP_NAME") {
            self.query.app_name = app;
        }
        if let Ok(level) = std::env::var("VARBEAM_LOG_LEVEL") {
            self.monitoring.log_level = level;
        }
    }

    /// Serialize to a pretty TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))
    }
}
