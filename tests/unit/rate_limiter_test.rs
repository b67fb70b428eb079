// Unit tests for the distributed rate limiter over the in-memory store

use lighter_permission_cache::clock::ManualClock;
use lighter_permission_cache::collaborators::null_monitor;
use lighter_permission_cache::config::{LimitSpec, RateLimiterConfig, ResilienceConfig};
use lighter_permission_cache::keys::KeySpace;
use lighter_permission_cache::resilience::{
    RateAlgorithm, RateDimension, RateDimensions, ResilienceContext, ResilienceRegistry,
};
use lighter_permission_cache::store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

fn registry() -> (Arc<ManualClock>, Arc<MemoryStore>, ResilienceRegistry) {
    // Start on a window boundary so window arithmetic stays readable
    let clock = Arc::new(ManualClock::new(10_000));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let context = ResilienceContext::new(
        store.clone(),
        KeySpace::new("pc"),
        clock.clone(),
        null_monitor(),
        ResilienceConfig::default(),
    );
    (clock, store, ResilienceRegistry::new(context))
}

#[tokio::test]
async fn test_token_bucket_burst_then_refill() {
    let (clock, _store, registry) = registry();
    registry
        .configs()
        .set_rate_limiter(
            "api",
            RateLimiterConfig::new(
                RateAlgorithm::TokenBucket,
                LimitSpec::new(10, Duration::from_secs(1)).with_burst(5),
            ),
        )
        .await
        .unwrap();
    let limiter = registry.rate_limiter("api");

    for i in 0..5 {
        let decision = limiter.check().await;
        assert!(decision.allowed, "call {} should be allowed", i);
        assert_eq!(decision.remaining, 4 - i);
    }

    let denied = limiter.check().await;
    assert!(!denied.allowed);
    assert_eq!(denied.limited_by, Some(RateDimension::Combined));
    assert!(denied.retry_after > Duration::ZERO);
    assert!(denied.retry_after <= Duration::from_millis(100));

    // 10 tokens per second refill one token every 100ms
    clock.advance(Duration::from_millis(100));
    assert!(limiter.check().await.allowed);
    assert!(!limiter.check().await.allowed);

    assert_eq!(limiter.allowed_calls(), 6);
    assert_eq!(limiter.denied_calls(), 2);
}

#[tokio::test]
async fn test_sliding_window_weights_previous_window() {
    let (clock, _store, registry) = registry();
    registry
        .configs()
        .set_rate_limiter(
            "search",
            RateLimiterConfig::new(
                RateAlgorithm::SlidingWindow,
                LimitSpec::new(4, Duration::from_secs(1)),
            ),
        )
        .await
        .unwrap();
    let limiter = registry.rate_limiter("search");

    clock.advance(Duration::from_millis(900));
    for _ in 0..4 {
        assert!(limiter.check().await.allowed);
    }
    assert!(!limiter.check().await.allowed);

    // A quarter into the next window three of the previous four still count
    clock.advance(Duration::from_millis(350));
    assert!(limiter.check().await.allowed);
    assert!(!limiter.check().await.allowed);
}

#[tokio::test]
async fn test_fixed_window_resets_at_boundary() {
    let (clock, _store, registry) = registry();
    registry
        .configs()
        .set_rate_limiter(
            "export",
            RateLimiterConfig::new(
                RateAlgorithm::FixedWindow,
                LimitSpec::new(2, Duration::from_secs(1)),
            ),
        )
        .await
        .unwrap();
    let limiter = registry.rate_limiter("export");

    assert!(limiter.check().await.allowed);
    assert!(limiter.check().await.allowed);
    let denied = limiter.check().await;
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Duration::from_secs(1));

    clock.advance(Duration::from_secs(1));
    assert!(limiter.check().await.allowed);
}

#[tokio::test]
async fn test_per_user_limit_is_most_restrictive() {
    let (_clock, _store, registry) = registry();
    let mut config = RateLimiterConfig::new(
        RateAlgorithm::TokenBucket,
        LimitSpec::new(100, Duration::from_secs(1)),
    );
    config.per_user = Some(LimitSpec::new(2, Duration::from_secs(60)));
    registry
        .configs()
        .set_rate_limiter("messages", config)
        .await
        .unwrap();
    let limiter = registry.rate_limiter("messages");

    let alice = RateDimensions::new().user("alice");
    assert!(limiter.check_dimensions(&alice).await.allowed);
    assert!(limiter.check_dimensions(&alice).await.allowed);

    let denied = limiter.check_dimensions(&alice).await;
    assert!(!denied.allowed);
    assert_eq!(denied.limited_by, Some(RateDimension::User));

    // Other users and anonymous calls only see the combined ceiling
    assert!(limiter.check_dimensions(&RateDimensions::new().user("bob")).await.allowed);
    assert!(limiter.check().await.allowed);
}

#[tokio::test]
async fn test_store_outage_falls_back_to_local_limiter() {
    let (_clock, store, registry) = registry();
    registry
        .configs()
        .set_rate_limiter(
            "api",
            RateLimiterConfig::new(
                RateAlgorithm::TokenBucket,
                LimitSpec::new(3, Duration::from_secs(60)),
            ),
        )
        .await
        .unwrap();
    let limiter = registry.rate_limiter("api");

    store.set_available(false);
    let decision = limiter.check().await;
    assert!(decision.allowed);
    assert!(decision.degraded);
    assert_eq!(limiter.store_errors(), 1);
}
