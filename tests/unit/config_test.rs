//! Unit tests for configuration loading
//!
//! This test suite ensures the configuration system works correctly across
//! all scenarios including:
//! - Loading default configuration
//! - Environment-specific overrides
//! - Environment variable precedence
//! - Configuration validation
//! - Invalid value detection

use lighter_permission_cache::config::*;
use lighter_permission_cache::resilience::RateAlgorithm;
use serial_test::serial;
use std::env;

mod utils {
    /// Clean up environment variables with the PERMISSION_CACHE prefix
    pub fn clean_env_vars() {
        let keys: Vec<String> = std::env::vars()
            .filter(|(k, _)| k.starts_with("PERMISSION_CACHE"))
            .map(|(k, _)| k)
            .collect();

        for key in keys {
            unsafe { std::env::remove_var(&key) };
        }
        unsafe { std::env::remove_var("APP_ENV") };
    }
}

// =============================================================================
// Loading
// =============================================================================

#[tokio::test]
#[serial]
async fn test_load_default_config_success() {
    utils::clean_env_vars();

    let config = load();
    assert!(config.is_ok(), "Failed to load default configuration: {:?}", config.err());
    let config = config.unwrap();

    assert_eq!(config.app.name, "lighter-permission-cache");
    assert_eq!(config.app.environment, "development");
    assert!(!config.redis.enabled);
    assert_eq!(config.cache.key_prefix, "pc");
    assert_eq!(config.cache.l1_ttl_ms, 60_000);
    assert_eq!(config.invalidation.max_queue_len, 1000);
    assert_eq!(config.resilience.circuit_breaker.failure_threshold, 5);
    assert_eq!(config.resilience.rate_limiter.algorithm, RateAlgorithm::TokenBucket);
    assert_eq!(config.observability.log_format, LogFormat::Compact);
}

#[tokio::test]
#[serial]
async fn test_production_overrides_defaults() {
    utils::clean_env_vars();
    unsafe { env::set_var("APP_ENV", "production") };

    let config = load().unwrap();
    assert_eq!(config.app.environment, "production");
    assert!(config.redis.enabled);
    assert_eq!(config.observability.log_format, LogFormat::Json);
    // Untouched sections keep the base values
    assert_eq!(config.cache.l2_ttl_ms, 300_000);

    utils::clean_env_vars();
}

#[tokio::test]
#[serial]
async fn test_env_vars_take_precedence() {
    utils::clean_env_vars();
    unsafe {
        env::set_var("PERMISSION_CACHE__CACHE__L1_TTL_MS", "1234");
        env::set_var("PERMISSION_CACHE__INVALIDATION__BATCH_SIZE", "25");
        env::set_var("PERMISSION_CACHE__REDIS__URL", "redis://cache:6380");
    };

    let config = load().unwrap();
    assert_eq!(config.cache.l1_ttl_ms, 1234);
    assert_eq!(config.invalidation.batch_size, 25);
    assert_eq!(config.redis.url, "redis://cache:6380");

    utils::clean_env_vars();
}

#[tokio::test]
#[serial]
async fn test_invalid_env_value_fails_validation() {
    utils::clean_env_vars();
    unsafe { env::set_var("PERMISSION_CACHE__INVALIDATION__MAX_QUEUE_LEN", "0") };

    let result = load();
    assert!(matches!(result, Err(ConfigError::ValidationError(_))));

    utils::clean_env_vars();
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_defaults_are_valid() {
    assert!(AppConfig::default().validate().is_ok());
}

#[test]
fn test_cache_ttl_must_be_positive() {
    let mut config = AppConfig::default();
    config.cache.l2_ttl_ms = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_rate_limit_specs_are_checked() {
    let mut config = ResilienceConfig::default();
    config.rate_limiter.per_user = Some(LimitSpec {
        limit: 0,
        window_ms: 1_000,
        burst: None,
    });
    assert!(config.validate().is_err());
}

#[test]
fn test_primitive_config_is_tagged_json() {
    let config = PrimitiveConfig::from(CircuitBreakerConfig {
        failure_threshold: 3,
        recovery_timeout_ms: 1_000,
    });
    let json = serde_json::to_value(&config).unwrap();
    assert_eq!(json["type"], "circuit_breaker");
    assert_eq!(json["failure_threshold"], 3);

    let back: PrimitiveConfig = serde_json::from_value(json).unwrap();
    assert_eq!(back.kind(), PrimitiveKind::CircuitBreaker);
}

#[test]
fn test_named_overrides_win_over_section_defaults() {
    let mut config = ResilienceConfig::default();
    config.bulkheads.insert(
        "reports".to_string(),
        BulkheadConfig {
            max_concurrency: 2,
            lease_ms: 1_000,
        },
    );

    assert_eq!(
        config.default_for(PrimitiveKind::Bulkhead, "reports"),
        PrimitiveConfig::Bulkhead(BulkheadConfig {
            max_concurrency: 2,
            lease_ms: 1_000,
        })
    );
    assert_eq!(
        config.default_for(PrimitiveKind::Bulkhead, "other"),
        PrimitiveConfig::Bulkhead(config.bulkhead)
    );
}
