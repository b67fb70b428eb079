//! Circuit breaker lifecycle across processes sharing one store

use lighter_permission_cache::clock::ManualClock;
use lighter_permission_cache::collaborators::SharedMonitor;
use lighter_permission_cache::config::{CircuitBreakerConfig, ResilienceConfig};
use lighter_permission_cache::keys::KeySpace;
use lighter_permission_cache::resilience::{
    CircuitBreakerError, CircuitState, ResilienceContext, ResilienceRegistry, Transition,
};
use lighter_permission_cache::store::{MemoryStore, SharedStore};
use lighter_permission_cache::testing::RecordingMonitor;
use std::sync::Arc;
use std::time::Duration;

struct Cluster {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    monitor: Arc<RecordingMonitor>,
}

impl Cluster {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(5_000_000));
        Self {
            store: Arc::new(MemoryStore::with_clock(clock.clone())),
            clock,
            monitor: Arc::new(RecordingMonitor::default()),
        }
    }

    /// A registry as another process would build it
    fn process(&self) -> ResilienceRegistry {
        let store: SharedStore = self.store.clone();
        let monitor: SharedMonitor = self.monitor.clone();
        ResilienceRegistry::new(ResilienceContext::new(
            store,
            KeySpace::new("pc"),
            self.clock.clone(),
            monitor,
            ResilienceConfig::default(),
        ))
    }
}

async fn configure(registry: &ResilienceRegistry) {
    registry
        .configs()
        .set_circuit_breaker(
            "x",
            CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout_ms: 30_000,
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_full_lifecycle_closed_open_half_open_closed() {
    let cluster = Cluster::new();
    let registry = cluster.process();
    configure(&registry).await;
    let breaker = registry.circuit_breaker("x");

    assert!(breaker.check().await.can_execute);
    for _ in 0..2 {
        let decision = breaker.record_failure().await;
        assert_eq!(decision.state, CircuitState::Closed);
        assert!(decision.transition.is_none());
    }

    let opened = breaker.record_failure().await;
    assert_eq!(opened.state, CircuitState::Open);
    assert_eq!(opened.transition, Some(Transition::ClosedToOpen));
    assert_eq!(opened.failure_count, 3);

    let denied = breaker.check().await;
    assert!(!denied.can_execute);
    assert_eq!(denied.state, CircuitState::Open);

    // Just short of the recovery timeout nothing changes
    cluster.clock.advance(Duration::from_millis(29_999));
    assert!(!breaker.check().await.can_execute);

    cluster.clock.advance(Duration::from_millis(2));
    let trial = breaker.check().await;
    assert!(trial.can_execute);
    assert_eq!(trial.state, CircuitState::HalfOpen);
    assert_eq!(trial.transition, Some(Transition::OpenToHalfOpen));

    let closed = breaker.record_success().await;
    assert_eq!(closed.state, CircuitState::Closed);
    assert_eq!(closed.transition, Some(Transition::HalfOpenToClosed));
    assert_eq!(closed.failure_count, 0);
    assert_eq!(breaker.state().await, CircuitState::Closed);

    let transitions: Vec<String> = cluster
        .monitor
        .events_named("circuit_breaker_transition")
        .into_iter()
        .filter_map(|labels| labels.get("transition").cloned())
        .collect();
    assert_eq!(transitions.len(), 3);
}

#[tokio::test]
async fn test_failure_in_half_open_reopens_and_restarts_timer() {
    let cluster = Cluster::new();
    let registry = cluster.process();
    configure(&registry).await;
    let breaker = registry.circuit_breaker("x");

    for _ in 0..3 {
        breaker.record_failure().await;
    }
    cluster.clock.advance(Duration::from_millis(30_001));
    assert_eq!(breaker.check().await.state, CircuitState::HalfOpen);

    let reopened = breaker.record_failure().await;
    assert_eq!(reopened.state, CircuitState::Open);
    assert_eq!(reopened.transition, Some(Transition::HalfOpenToOpen));

    cluster.clock.advance(Duration::from_millis(10_000));
    assert!(!breaker.check().await.can_execute);
    cluster.clock.advance(Duration::from_millis(20_000));
    assert!(breaker.check().await.can_execute);
}

#[tokio::test]
async fn test_processes_share_one_breaker() {
    let cluster = Cluster::new();
    let first = cluster.process();
    let second = cluster.process();
    configure(&first).await;

    // The second process reads the stored configuration, not its defaults
    let config = second.configs().circuit_breaker("x").await;
    assert_eq!(config.failure_threshold, 3);

    first.circuit_breaker("x").record_failure().await;
    second.circuit_breaker("x").record_failure().await;
    first.circuit_breaker("x").record_failure().await;

    let result = second
        .circuit_breaker("x")
        .call(async { Ok::<_, std::io::Error>("unreachable") })
        .await;
    assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
    assert_eq!(second.circuit_breaker("x").rejected_calls(), 1);
}

#[tokio::test]
async fn test_breaker_fails_open_while_store_is_down() {
    let cluster = Cluster::new();
    let registry = cluster.process();
    configure(&registry).await;
    let breaker = registry.circuit_breaker("x");

    for _ in 0..3 {
        breaker.record_failure().await;
    }
    assert_eq!(breaker.state().await, CircuitState::Open);

    cluster.store.set_available(false);
    let decision = breaker.check().await;
    assert!(decision.can_execute);
    assert_eq!(decision.state, CircuitState::Closed);
    assert_eq!(breaker.store_errors(), 1);

    cluster.store.set_available(true);
    assert!(!breaker.check().await.can_execute);
}

#[tokio::test]
async fn test_reset_state_closes_breaker_for_everyone() {
    let cluster = Cluster::new();
    let first = cluster.process();
    let second = cluster.process();
    configure(&first).await;

    for _ in 0..3 {
        first.circuit_breaker("x").record_failure().await;
    }
    assert_eq!(second.circuit_breaker("x").state().await, CircuitState::Open);

    first.reset_state("x").await.unwrap();
    assert_eq!(second.circuit_breaker("x").state().await, CircuitState::Closed);
    assert!(second.circuit_breaker("x").check().await.can_execute);
}
