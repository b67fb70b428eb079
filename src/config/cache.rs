use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ConfigError, Validate, invalid};

/// Hybrid permission cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Namespace prepended to every store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// L1 time to live in milliseconds
    #[serde(default = "default_l1_ttl_ms")]
    pub l1_ttl_ms: u64,
    /// L2 time to live in milliseconds, used when `set` is given no TTL
    #[serde(default = "default_l2_ttl_ms")]
    pub l2_ttl_ms: u64,
    /// L1 time to live while the L2 breaker is open
    #[serde(default = "default_degraded_l1_ttl_ms")]
    pub degraded_l1_ttl_ms: u64,
    /// Maximum number of L1 entries
    #[serde(default = "default_l1_max_entries")]
    pub l1_max_entries: usize,
    /// Interval between L1 expiry sweeps in milliseconds
    #[serde(default = "default_l1_cleanup_interval_ms")]
    pub l1_cleanup_interval_ms: u64,
    /// Encoded entries larger than this many bytes are compressed in L2
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// Lease of the population lock in milliseconds
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    /// Extra acquisition attempts for the population lock
    #[serde(default = "default_lock_retry_count")]
    pub lock_retry_count: u32,
    #[serde(default = "default_lock_retry_interval_ms")]
    pub lock_retry_interval_ms: u64,
    /// Lease renewal period while recomputing under the lock; 0 disables renewal
    #[serde(default = "default_lock_renew_interval_ms")]
    pub lock_renew_interval_ms: u64,
    /// Subjects above which role invalidation defers L2 deletes to the queue
    #[serde(default = "default_role_fanout_threshold")]
    pub role_fanout_threshold: usize,
    /// Circuit breaker guarding L2 calls
    #[serde(default = "default_l2_circuit_breaker")]
    pub l2_circuit_breaker: Option<String>,
    /// Rate limiter guarding L2 calls
    #[serde(default = "default_l2_rate_limiter")]
    pub l2_rate_limiter: Option<String>,
    /// Bulkhead capping concurrent recomputations in `get_or_compute`
    #[serde(default = "default_recompute_bulkhead")]
    pub recompute_bulkhead: Option<String>,
}

fn default_key_prefix() -> String {
    "pc".to_string()
}

fn default_l1_ttl_ms() -> u64 {
    60_000
}

fn default_l2_ttl_ms() -> u64 {
    300_000
}

fn default_degraded_l1_ttl_ms() -> u64 {
    5_000
}

fn default_l1_max_entries() -> usize {
    100_000
}

fn default_l1_cleanup_interval_ms() -> u64 {
    30_000
}

fn default_compression_threshold() -> usize {
    1024
}

fn default_lock_ttl_ms() -> u64 {
    5_000
}

fn default_lock_retry_count() -> u32 {
    3
}

fn default_lock_retry_interval_ms() -> u64 {
    50
}

fn default_lock_renew_interval_ms() -> u64 {
    2_000
}

fn default_role_fanout_threshold() -> usize {
    100
}

fn default_l2_circuit_breaker() -> Option<String> {
    Some("permission_cache_l2".to_string())
}

fn default_l2_rate_limiter() -> Option<String> {
    Some("permission_cache_l2".to_string())
}

fn default_recompute_bulkhead() -> Option<String> {
    None
}

impl CacheConfig {
    pub fn l1_ttl(&self) -> Duration {
        Duration::from_millis(self.l1_ttl_ms)
    }

    pub fn l2_ttl(&self) -> Duration {
        Duration::from_millis(self.l2_ttl_ms)
    }

    pub fn degraded_l1_ttl(&self) -> Duration {
        Duration::from_millis(self.degraded_l1_ttl_ms)
    }

    pub fn l1_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.l1_cleanup_interval_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    pub fn lock_renew_interval(&self) -> Option<Duration> {
        (self.lock_renew_interval_ms > 0).then(|| Duration::from_millis(self.lock_renew_interval_ms))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            l1_ttl_ms: default_l1_ttl_ms(),
            l2_ttl_ms: default_l2_ttl_ms(),
            degraded_l1_ttl_ms: default_degraded_l1_ttl_ms(),
            l1_max_entries: default_l1_max_entries(),
            l1_cleanup_interval_ms: default_l1_cleanup_interval_ms(),
            compression_threshold: default_compression_threshold(),
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_retry_count: default_lock_retry_count(),
            lock_retry_interval_ms: default_lock_retry_interval_ms(),
            lock_renew_interval_ms: default_lock_renew_interval_ms(),
            role_fanout_threshold: default_role_fanout_threshold(),
            l2_circuit_breaker: default_l2_circuit_breaker(),
            l2_rate_limiter: default_l2_rate_limiter(),
            recompute_bulkhead: default_recompute_bulkhead(),
        }
    }
}

impl Validate for CacheConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.contains('{') || self.key_prefix.contains('}') {
            return Err(invalid("cache.key_prefix cannot contain hash tag braces"));
        }
        if self.l1_ttl_ms == 0 || self.l2_ttl_ms == 0 {
            return Err(invalid("cache.l1_ttl_ms and cache.l2_ttl_ms must be > 0"));
        }
        if self.degraded_l1_ttl_ms == 0 {
            return Err(invalid("cache.degraded_l1_ttl_ms must be > 0"));
        }
        if self.degraded_l1_ttl_ms > self.l1_ttl_ms {
            return Err(invalid("cache.degraded_l1_ttl_ms must be <= cache.l1_ttl_ms"));
        }
        if self.l1_max_entries == 0 {
            return Err(invalid("cache.l1_max_entries must be > 0"));
        }
        if self.l1_cleanup_interval_ms == 0 {
            return Err(invalid("cache.l1_cleanup_interval_ms must be > 0"));
        }
        if self.lock_ttl_ms == 0 {
            return Err(invalid("cache.lock_ttl_ms must be > 0"));
        }
        if self.lock_renew_interval_ms >= self.lock_ttl_ms {
            return Err(invalid("cache.lock_renew_interval_ms must be < cache.lock_ttl_ms"));
        }
        Ok(())
    }
}
