use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ConfigError, Validate, invalid};

/// Distributed store connection settings
///
/// With `enabled = false` the system runs on the in-memory store, which keeps
/// every semantic but shares nothing across processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,
    /// Connection URL (redis://host:port/db)
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Upper bound for every single store operation, in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_operation_timeout_ms() -> u64 {
    500
}

impl RedisConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl Validate for RedisConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.url.is_empty() {
            return Err(invalid("redis.url cannot be empty when redis is enabled"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(invalid("redis.connect_timeout_ms must be > 0"));
        }
        if self.operation_timeout_ms == 0 {
            return Err(invalid("redis.operation_timeout_ms must be > 0"));
        }
        Ok(())
    }
}
