use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use super::{ConfigError, Validate, invalid};
use crate::resilience::state::{BreakerPolicy, RateAlgorithm};

/// Resilience configuration
///
/// The per-kind sections are the defaults every named instance starts from;
/// the maps override them per name. At runtime the distributed config store
/// takes precedence over both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// How long a process trusts its cached copy of an instance config
    #[serde(default = "default_config_cache_ttl_ms")]
    pub config_cache_ttl_ms: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    #[serde(default)]
    pub bulkhead: BulkheadConfig,
    #[serde(default)]
    pub circuit_breakers: HashMap<String, CircuitBreakerConfig>,
    #[serde(default)]
    pub rate_limiters: HashMap<String, RateLimiterConfig>,
    #[serde(default)]
    pub bulkheads: HashMap<String, BulkheadConfig>,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Milliseconds the circuit stays open before a trial call
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

/// One limit: `limit` calls per `window_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSpec {
    pub limit: u64,
    pub window_ms: u64,
    /// Token bucket capacity; defaults to `limit`
    #[serde(default)]
    pub burst: Option<u64>,
}

impl LimitSpec {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window_ms: window.as_millis() as u64,
            burst: None,
        }
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn effective_burst(&self) -> u64 {
        self.burst.unwrap_or(self.limit)
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.limit == 0 {
            return Err(invalid(format!("{}.limit must be > 0", field)));
        }
        if self.window_ms == 0 {
            return Err(invalid(format!("{}.window_ms must be > 0", field)));
        }
        if self.burst == Some(0) {
            return Err(invalid(format!("{}.burst must be > 0", field)));
        }
        Ok(())
    }
}

/// Rate limiter configuration
///
/// The combined limit always applies; the optional dimensions apply when the
/// call carries the matching identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: RateAlgorithm,
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default)]
    pub burst: Option<u64>,
    #[serde(default)]
    pub per_user: Option<LimitSpec>,
    #[serde(default)]
    pub per_server: Option<LimitSpec>,
    #[serde(default)]
    pub per_ip: Option<LimitSpec>,
}

impl RateLimiterConfig {
    pub fn new(algorithm: RateAlgorithm, combined: LimitSpec) -> Self {
        Self {
            algorithm,
            limit: combined.limit,
            window_ms: combined.window_ms,
            burst: combined.burst,
            per_user: None,
            per_server: None,
            per_ip: None,
        }
    }

    /// The ceiling shared by every caller
    pub fn combined(&self) -> LimitSpec {
        LimitSpec {
            limit: self.limit,
            window_ms: self.window_ms,
            burst: self.burst,
        }
    }
}

/// Bulkhead configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u64,
    /// Lease of each admitted call. A slot never released by its holder is
    /// freed this long after admission, so it must outlast the longest call.
    /// A call running past it no longer counts against the limit.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
}

impl BulkheadConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

/// Kind of a resilience primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    CircuitBreaker,
    RateLimiter,
    Bulkhead,
}

impl PrimitiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimitiveKind::CircuitBreaker => "circuit_breaker",
            PrimitiveKind::RateLimiter => "rate_limiter",
            PrimitiveKind::Bulkhead => "bulkhead",
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored configuration of one named instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrimitiveConfig {
    CircuitBreaker(CircuitBreakerConfig),
    RateLimiter(RateLimiterConfig),
    Bulkhead(BulkheadConfig),
}

impl PrimitiveConfig {
    pub fn kind(&self) -> PrimitiveKind {
        match self {
            PrimitiveConfig::CircuitBreaker(_) => PrimitiveKind::CircuitBreaker,
            PrimitiveConfig::RateLimiter(_) => PrimitiveKind::RateLimiter,
            PrimitiveConfig::Bulkhead(_) => PrimitiveKind::Bulkhead,
        }
    }
}

impl Validate for PrimitiveConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            PrimitiveConfig::CircuitBreaker(config) => config.validate(),
            PrimitiveConfig::RateLimiter(config) => config.validate(),
            PrimitiveConfig::Bulkhead(config) => config.validate(),
        }
    }
}

impl From<CircuitBreakerConfig> for PrimitiveConfig {
    fn from(config: CircuitBreakerConfig) -> Self {
        PrimitiveConfig::CircuitBreaker(config)
    }
}

impl From<RateLimiterConfig> for PrimitiveConfig {
    fn from(config: RateLimiterConfig) -> Self {
        PrimitiveConfig::RateLimiter(config)
    }
}

impl From<BulkheadConfig> for PrimitiveConfig {
    fn from(config: BulkheadConfig) -> Self {
        PrimitiveConfig::Bulkhead(config)
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn policy(&self) -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: self.failure_threshold,
            recovery_timeout_ms: self.recovery_timeout_ms,
        }
    }
}

impl ResilienceConfig {
    pub fn config_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.config_cache_ttl_ms)
    }

    /// Configuration an instance uses when the store holds none for it
    pub fn default_for(&self, kind: PrimitiveKind, name: &str) -> PrimitiveConfig {
        match kind {
            PrimitiveKind::CircuitBreaker => self
                .circuit_breakers
                .get(name)
                .copied()
                .unwrap_or(self.circuit_breaker)
                .into(),
            PrimitiveKind::RateLimiter => self
                .rate_limiters
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.rate_limiter.clone())
                .into(),
            PrimitiveKind::Bulkhead => self
                .bulkheads
                .get(name)
                .copied()
                .unwrap_or(self.bulkhead)
                .into(),
        }
    }
}

// Default functions for ResilienceConfig
fn default_config_cache_ttl_ms() -> u64 {
    5_000
}

// Default functions for CircuitBreakerConfig
fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    60_000 // 1 minute
}

// Default functions for RateLimiterConfig
fn default_algorithm() -> RateAlgorithm {
    RateAlgorithm::TokenBucket
}

fn default_limit() -> u64 {
    1_000
}

fn default_window_ms() -> u64 {
    1_000
}

// Default functions for BulkheadConfig
fn default_max_concurrency() -> u64 {
    10
}

fn default_lease_ms() -> u64 {
    30_000
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            config_cache_ttl_ms: default_config_cache_ttl_ms(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            bulkhead: BulkheadConfig::default(),
            circuit_breakers: HashMap::new(),
            rate_limiters: HashMap::new(),
            bulkheads: HashMap::new(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            limit: default_limit(),
            window_ms: default_window_ms(),
            burst: None,
            per_user: None,
            per_server: None,
            per_ip: None,
        }
    }
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            lease_ms: default_lease_ms(),
        }
    }
}

impl Validate for ResilienceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        self.rate_limiter.validate()?;
        self.bulkhead.validate()?;
        for config in self.circuit_breakers.values() {
            config.validate()?;
        }
        for config in self.rate_limiters.values() {
            config.validate()?;
        }
        for config in self.bulkheads.values() {
            config.validate()?;
        }
        Ok(())
    }
}

impl Validate for CircuitBreakerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold must be > 0"));
        }
        if self.recovery_timeout_ms == 0 {
            return Err(invalid("circuit_breaker.recovery_timeout_ms must be > 0"));
        }
        Ok(())
    }
}

impl Validate for RateLimiterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.combined().validate("rate_limiter")?;
        if let Some(spec) = &self.per_user {
            spec.validate("rate_limiter.per_user")?;
        }
        if let Some(spec) = &self.per_server {
            spec.validate("rate_limiter.per_server")?;
        }
        if let Some(spec) = &self.per_ip {
            spec.validate("rate_limiter.per_ip")?;
        }
        Ok(())
    }
}

impl Validate for BulkheadConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(invalid("bulkhead.max_concurrency must be > 0"));
        }
        if self.lease_ms == 0 {
            return Err(invalid("bulkhead.lease_ms must be > 0"));
        }
        Ok(())
    }
}
