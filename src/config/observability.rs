use serde::{Deserialize, Serialize};

use super::{ConfigError, Validate, invalid};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, multi-line (development)
    Pretty,
    /// Single-line, no colors
    Compact,
    /// One JSON object per event (production)
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG` when set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
    /// Include file and line numbers
    #[serde(default)]
    pub include_location: bool,
}

fn default_log_filter() -> String {
    "info,lighter_permission_cache=debug".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Compact
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            log_format: default_log_format(),
            include_location: false,
        }
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.log_filter.trim().is_empty() {
            return Err(invalid("observability.log_filter cannot be empty"));
        }
        Ok(())
    }
}
