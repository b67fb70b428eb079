//! Guards composed from registry names, used directly and as a tower layer

use lighter_permission_cache::clock::ManualClock;
use lighter_permission_cache::collaborators::null_monitor;
use lighter_permission_cache::config::{
    BulkheadConfig, CircuitBreakerConfig, LimitSpec, RateLimiterConfig, ResilienceConfig,
};
use lighter_permission_cache::keys::KeySpace;
use lighter_permission_cache::resilience::{
    CircuitState, GuardError, RateAlgorithm, RateDimension, RateDimensions, ResilienceContext,
    ResilienceLayer, ResilienceRegistry,
};
use lighter_permission_cache::store::MemoryStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tower::{Layer, ServiceBuilder, ServiceExt};

fn registry() -> (Arc<ManualClock>, Arc<MemoryStore>, ResilienceRegistry) {
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let registry = ResilienceRegistry::new(ResilienceContext::new(
        store.clone(),
        KeySpace::new("pc"),
        clock.clone(),
        null_monitor(),
        ResilienceConfig::default(),
    ));
    (clock, store, registry)
}

#[tokio::test]
async fn test_guard_reports_outcomes_to_breaker() {
    let (clock, _store, registry) = registry();
    registry
        .configs()
        .set_circuit_breaker(
            "billing",
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout_ms: 1_000,
            },
        )
        .await
        .unwrap();
    let guard = registry.guard().circuit_breaker("billing").build();

    for _ in 0..2 {
        let result = guard.run(async { Err::<(), _>("timeout") }).await;
        assert!(matches!(result, Err(GuardError::Inner("timeout"))));
    }
    assert_eq!(
        registry.circuit_breaker("billing").state().await,
        CircuitState::Open
    );

    let calls = AtomicU32::new(0);
    let calls = &calls;
    let rejected = guard
        .call(|| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &str>(())
        })
        .await;
    assert!(rejected.unwrap_err().is_rejected());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The trial call succeeds and closes the circuit
    clock.advance(Duration::from_millis(1_000));
    assert_eq!(guard.run(async { Ok::<_, &str>(7) }).await.unwrap(), 7);
    assert_eq!(
        registry.circuit_breaker("billing").state().await,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_guard_with_dimensions_limits_each_user() {
    let (_clock, _store, registry) = registry();
    let mut config = RateLimiterConfig::new(
        RateAlgorithm::FixedWindow,
        LimitSpec::new(1_000, Duration::from_secs(60)),
    );
    config.per_user = Some(LimitSpec::new(1, Duration::from_secs(60)));
    registry
        .configs()
        .set_rate_limiter("messages", config)
        .await
        .unwrap();

    let guard = registry.guard().rate_limiter("messages").build();
    let alice = guard.with_dimensions(RateDimensions::new().user("alice"));
    let bob = guard.with_dimensions(RateDimensions::new().user("bob"));

    assert!(alice.run(async { Ok::<_, String>(()) }).await.is_ok());
    match alice.run(async { Ok::<_, String>(()) }).await {
        Err(GuardError::RateLimited { dimension, .. }) => {
            assert_eq!(dimension, RateDimension::User)
        }
        other => panic!("expected a per-user rejection, got {:?}", other),
    }
    assert!(bob.run(async { Ok::<_, String>(()) }).await.is_ok());
}

#[tokio::test]
async fn test_bulkhead_guard_rejects_while_full() {
    let (_clock, _store, registry) = registry();
    registry
        .configs()
        .set_bulkhead(
            "reports",
            BulkheadConfig {
                max_concurrency: 2,
                lease_ms: 30_000,
            },
        )
        .await
        .unwrap();
    let guard = registry.guard().bulkhead("reports").build();
    let bulkhead = registry.bulkhead("reports");

    let first = bulkhead.try_acquire().await.unwrap();
    let second = bulkhead.try_acquire().await.unwrap();
    let result = guard.run(async { Ok::<_, String>(()) }).await;
    assert!(matches!(result, Err(GuardError::BulkheadFull { .. })));
    assert_eq!(bulkhead.rejected_calls(), 1);

    first.release().await;
    assert!(guard.run(async { Ok::<_, String>(()) }).await.is_ok());
    second.release().await;

    let record = bulkhead.snapshot().await.unwrap();
    assert_eq!(record.active_calls, 0);
}

#[tokio::test]
async fn test_layer_in_service_builder() {
    let (_clock, _store, registry) = registry();
    registry
        .configs()
        .set_rate_limiter(
            "lookup",
            RateLimiterConfig::new(
                RateAlgorithm::TokenBucket,
                LimitSpec::new(2, Duration::from_secs(60)),
            ),
        )
        .await
        .unwrap();

    let service = ServiceBuilder::new()
        .layer(ResilienceLayer::new(
            registry.guard().rate_limiter("lookup").build(),
        ))
        .service_fn(|name: &'static str| async move {
            Ok::<_, std::io::Error>(name.len())
        });

    assert_eq!(service.clone().oneshot("alice").await.unwrap(), 5);
    assert_eq!(service.clone().oneshot("bob").await.unwrap(), 3);
    let rejected = service.oneshot("carol").await.unwrap_err();
    assert!(rejected.is_rejected());
}

#[tokio::test]
async fn test_layer_passes_inner_errors_through() {
    let (_clock, _store, registry) = registry();
    let layer = ResilienceLayer::new(registry.guard().circuit_breaker("flaky").build());
    let service = layer.layer(tower::service_fn(|fail: bool| async move {
        if fail {
            Err(std::io::Error::other("down"))
        } else {
            Ok("up")
        }
    }));

    assert_eq!(service.clone().oneshot(false).await.unwrap(), "up");
    let error = service.oneshot(true).await.unwrap_err();
    assert!(!error.is_rejected());
    assert_eq!(error.into_inner().unwrap().to_string(), "down");
    assert_eq!(registry.circuit_breaker("flaky").total_failures(), 1);
}
