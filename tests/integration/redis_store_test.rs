//! Tests against a live Redis
//!
//! Run with `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`.
//! Every test works under its own random key prefix.

use lighter_permission_cache::cache::PermissionSet;
use lighter_permission_cache::clock::SystemClock;
use lighter_permission_cache::collaborators::null_monitor;
use lighter_permission_cache::config::{
    AppConfig, BulkheadConfig, CircuitBreakerConfig, LimitSpec, RateLimiterConfig,
    ResilienceConfig,
};
use lighter_permission_cache::keys::{CacheKey, KeySpace, Scope};
use lighter_permission_cache::lock::{DistributedLock, LockOptions};
use lighter_permission_cache::resilience::{
    CircuitState, RateAlgorithm, ResilienceContext, ResilienceRegistry,
};
use lighter_permission_cache::store::{RedisStore, SharedStore};
use lighter_permission_cache::PermissionCacheSystem;
use std::sync::Arc;
use std::time::Duration;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn unique_prefix() -> String {
    format!("pctest{}", rand::random::<u32>())
}

async fn store() -> SharedStore {
    Arc::new(
        RedisStore::new(&redis_url())
            .await
            .expect("Redis must be reachable at REDIS_URL"),
    )
}

async fn registry() -> ResilienceRegistry {
    ResilienceRegistry::new(ResilienceContext::new(
        store().await,
        KeySpace::new(unique_prefix()),
        Arc::new(SystemClock),
        null_monitor(),
        ResilienceConfig::default(),
    ))
}

#[tokio::test]
#[ignore]
async fn test_indexed_entries_are_deleted_together() {
    let store = store().await;
    let keys = KeySpace::new(unique_prefix());
    let index = keys.subject_index("u1");
    let global = keys.entry(&CacheKey::new("u1", Scope::Global));
    let server = keys.entry(&CacheKey::new("u1", Scope::server("s1")));

    for key in [&global, &server] {
        store
            .set_indexed(key, b"payload", Duration::from_secs(60), &index)
            .await
            .unwrap();
    }
    let values = store.get_many(&[global.clone(), server.clone()]).await.unwrap();
    assert!(values.iter().all(|value| value.as_deref() == Some(&b"payload"[..])));

    assert_eq!(store.delete_indexed(&index).await.unwrap(), 2);
    assert_eq!(store.get(&global).await.unwrap(), None);
    assert!(store.index_members(&index).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_lock_is_exclusive() {
    let store = store().await;
    let key = KeySpace::new(unique_prefix()).resource_lock("job");
    let options = LockOptions {
        ttl: Duration::from_secs(5),
        retry_count: 0,
        retry_interval: Duration::from_millis(10),
        renew_interval: None,
    };
    let first = DistributedLock::new(store.clone(), key.clone(), options);
    let second = DistributedLock::new(store.clone(), key, options);

    assert!(first.acquire().await);
    assert!(!second.acquire().await);
    assert!(!second.release().await);
    assert!(first.release().await);
    assert!(second.acquire().await);
    assert!(second.release().await);
}

#[tokio::test]
#[ignore]
async fn test_breaker_opens_in_redis() {
    let registry = registry().await;
    registry
        .configs()
        .set_circuit_breaker(
            "redis-breaker",
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout_ms: 60_000,
            },
        )
        .await
        .unwrap();
    let breaker = registry.circuit_breaker("redis-breaker");

    breaker.record_failure().await;
    assert_eq!(breaker.state().await, CircuitState::Closed);
    breaker.record_failure().await;
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert!(!breaker.check().await.can_execute);

    breaker.reset().await.unwrap();
    assert!(breaker.check().await.can_execute);
    registry.configs().clear_all().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_token_bucket_in_redis() {
    let registry = registry().await;
    registry
        .configs()
        .set_rate_limiter(
            "redis-limiter",
            RateLimiterConfig::new(
                RateAlgorithm::TokenBucket,
                LimitSpec::new(3, Duration::from_secs(60)),
            ),
        )
        .await
        .unwrap();
    let limiter = registry.rate_limiter("redis-limiter");

    for _ in 0..3 {
        let decision = limiter.check().await;
        assert!(decision.allowed);
        assert!(!decision.degraded);
    }
    assert!(!limiter.check().await.allowed);
    registry.reset_state("redis-limiter").await.unwrap();
    registry.configs().clear_all().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_sliding_window_in_redis() {
    let registry = registry().await;
    registry
        .configs()
        .set_rate_limiter(
            "redis-window",
            RateLimiterConfig::new(
                RateAlgorithm::SlidingWindow,
                LimitSpec::new(2, Duration::from_secs(60)),
            ),
        )
        .await
        .unwrap();
    let limiter = registry.rate_limiter("redis-window");

    assert!(limiter.check().await.allowed);
    assert!(limiter.check().await.allowed);
    let denied = limiter.check().await;
    assert!(!denied.allowed);
    assert!(!denied.degraded);
    registry.configs().clear_all().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_bulkhead_in_redis() {
    let registry = registry().await;
    registry
        .configs()
        .set_bulkhead(
            "redis-bulkhead",
            BulkheadConfig {
                max_concurrency: 1,
                lease_ms: 10_000,
            },
        )
        .await
        .unwrap();
    let bulkhead = registry.bulkhead("redis-bulkhead");

    let permit = bulkhead.try_acquire().await.unwrap();
    assert!(!permit.is_local());
    assert!(bulkhead.try_acquire().await.is_none());
    permit.release().await;
    let snapshot = bulkhead.snapshot().await.unwrap();
    assert_eq!(snapshot.active_calls, 0);
    assert_eq!(snapshot.total_calls, 1);

    bulkhead.reset().await.unwrap();
    registry.configs().clear_all().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_system_round_trip_in_redis() {
    let mut config = AppConfig::default();
    config.cache.key_prefix = unique_prefix();
    let system =
        PermissionCacheSystem::with_store(config, store().await, Arc::new(SystemClock), null_monitor());
    let scope = Scope::server("guild");
    let perms: PermissionSet = (0..200).map(|i| format!("perm.{}", i)).collect();

    let outcome = system.cache().set("u1", &scope, perms.clone(), None).await;
    assert!(outcome.l2_written);
    assert!(outcome.compressed);

    system.cache().clear_local();
    assert_eq!(system.cache().get("u1", &scope).await, Some(perms));

    let report = system.cache().invalidate_subject("u1").await;
    assert_eq!(report.l2_removed, Some(1));
    assert_eq!(system.cache().get("u1", &scope).await, None);
}
