use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ConfigError, Validate, invalid};

/// Delayed invalidation queue and drain worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationConfig {
    /// Run the background drain worker
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Drain tick in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Store operations per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Ring buffer capacity; the oldest task is dropped past it
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: usize,
    /// Oldest task age that forces a flush, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Below this many queued tasks the worker waits
    #[serde(default = "default_min_queue_size")]
    pub min_queue_size: usize,
    /// Tasks per second of growth above which the worker waits for the burst to settle
    #[serde(default = "default_max_growth_rate")]
    pub max_growth_rate: f64,
    /// Tasks per second below which only one batch is flushed per tick
    #[serde(default = "default_min_processing_rate")]
    pub min_processing_rate: f64,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    1_000
}

fn default_batch_size() -> usize {
    100
}

fn default_max_queue_len() -> usize {
    1000
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_min_queue_size() -> usize {
    10
}

fn default_max_growth_rate() -> f64 {
    500.0
}

fn default_min_processing_rate() -> f64 {
    50.0
}

impl InvalidationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_ms: default_interval_ms(),
            batch_size: default_batch_size(),
            max_queue_len: default_max_queue_len(),
            max_delay_ms: default_max_delay_ms(),
            min_queue_size: default_min_queue_size(),
            max_growth_rate: default_max_growth_rate(),
            min_processing_rate: default_min_processing_rate(),
        }
    }
}

impl Validate for InvalidationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(invalid("invalidation.interval_ms must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(invalid("invalidation.batch_size must be > 0"));
        }
        if self.max_queue_len == 0 {
            return Err(invalid("invalidation.max_queue_len must be > 0"));
        }
        if self.min_queue_size > self.max_queue_len {
            return Err(invalid("invalidation.min_queue_size must be <= max_queue_len"));
        }
        if self.max_growth_rate <= 0.0 {
            return Err(invalid("invalidation.max_growth_rate must be > 0.0"));
        }
        if self.min_processing_rate < 0.0 {
            return Err(invalid("invalidation.min_processing_rate cannot be negative"));
        }
        Ok(())
    }
}
