//! Delayed invalidation: queued during outages and fan-outs, drained later

use lighter_permission_cache::cache::PermissionSet;
use lighter_permission_cache::clock::ManualClock;
use lighter_permission_cache::collaborators::SharedMonitor;
use lighter_permission_cache::config::AppConfig;
use lighter_permission_cache::invalidation::{BatchDecision, InvalidationLevel};
use lighter_permission_cache::keys::Scope;
use lighter_permission_cache::store::MemoryStore;
use lighter_permission_cache::testing::{RecordingMonitor, StaticPermissionSource};
use lighter_permission_cache::PermissionCacheSystem;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    monitor: Arc<RecordingMonitor>,
    system: PermissionCacheSystem,
}

fn harness(config: AppConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let monitor = Arc::new(RecordingMonitor::default());
    let shared: SharedMonitor = monitor.clone();
    let system = PermissionCacheSystem::with_store(config, store.clone(), clock.clone(), shared);
    Harness {
        clock,
        store,
        monitor,
        system,
    }
}

fn perms(names: &[&str]) -> PermissionSet {
    names.iter().copied().collect()
}

#[tokio::test]
async fn test_outage_invalidation_is_applied_after_recovery() {
    let h = harness(AppConfig::default());
    let cache = h.system.cache();
    let scopes = [Scope::Global, Scope::server("guild-1")];
    for scope in &scopes {
        assert!(cache.set("u1", scope, perms(&["read"]), None).await.l2_written);
    }

    h.store.set_available(false);
    let report = cache.invalidate_subject("u1").await;
    assert_eq!(report.l1_removed, 2);
    assert_eq!(report.l2_removed, None);
    assert!(report.queued);
    assert!(cache.is_degraded());
    assert_eq!(cache.queue().len(), 1);

    h.store.set_available(true);
    for scope in &scopes {
        assert!(h.store.contains_key(&cache.entry_key("u1", scope)));
    }

    // One fresh task is too small a batch to drain yet
    let waiting = h.system.worker().run_once().await;
    assert_eq!(waiting.decision, BatchDecision::Wait);
    assert_eq!(cache.queue().len(), 1);

    h.clock.advance(Duration::from_millis(5_000));
    let report = h.system.worker().run_once().await;
    assert_eq!(report.decision, BatchDecision::Flush(1));
    assert_eq!(report.applied, 1);
    assert_eq!(report.removed, 2);
    assert!(cache.queue().is_empty());

    for scope in &scopes {
        assert!(!h.store.contains_key(&cache.entry_key("u1", scope)));
        assert_eq!(cache.get("u1", scope).await, None);
    }
    assert!(!cache.is_degraded());
    assert_eq!(h.monitor.metric_values("invalidation_batch_size"), vec![1.0]);
}

#[tokio::test]
async fn test_failed_batch_is_requeued() {
    let h = harness(AppConfig::default());
    let cache = h.system.cache();
    cache.set("u1", &Scope::Global, perms(&["a"]), None).await;
    cache.add_delayed_invalidation(
        cache.keys().subject_index("u1"),
        InvalidationLevel::L2,
        "test",
    );

    h.clock.advance(Duration::from_millis(6_000));
    h.store.set_available(false);
    let report = h.system.worker().run_once().await;
    assert_eq!(report.drained, 1);
    assert_eq!(report.applied, 0);
    assert_eq!(report.requeued, 1);
    assert_eq!(cache.queue().len(), 1);

    h.store.set_available(true);
    let report = h.system.worker().run_once().await;
    assert_eq!(report.applied, 1);
    assert!(cache.queue().is_empty());
    assert_eq!(cache.queue().stats().requeued, 1);
}

#[tokio::test]
async fn test_large_role_fan_out_is_queued_then_flushed() {
    let mut config = AppConfig::default();
    config.cache.role_fanout_threshold = 2;
    let h = harness(config);
    let cache = h.system.cache();

    let members = ["u1", "u2", "u3"];
    let source = StaticPermissionSource::new().with_role("moderator", members);
    for subject in members {
        cache.set(subject, &Scope::Global, perms(&["ban"]), None).await;
    }

    let report = cache.invalidate_role("moderator", &source).await.unwrap();
    assert_eq!(report.subjects, 3);
    assert!(!report.immediate);
    assert_eq!(report.l1_removed, 3);
    assert_eq!(report.queued, 3);

    // L1 is already clean; L2 waits for the worker
    assert!(cache.local().is_empty());
    for subject in members {
        assert!(h.store.contains_key(&cache.entry_key(subject, &Scope::Global)));
    }

    let flushed = h.system.worker().flush().await;
    assert_eq!(flushed.decision, BatchDecision::Flush(3));
    assert_eq!(flushed.applied, 3);
    assert_eq!(flushed.removed, 3);
    for subject in members {
        assert!(!h.store.contains_key(&cache.entry_key(subject, &Scope::Global)));
    }
}

#[tokio::test]
async fn test_small_role_is_invalidated_inline() {
    let h = harness(AppConfig::default());
    let cache = h.system.cache();
    let source = StaticPermissionSource::new().with_role("admin", ["u1", "u2"]);
    cache.set("u1", &Scope::Global, perms(&["all"]), None).await;
    cache.set("u2", &Scope::channel("c1"), perms(&["all"]), None).await;

    let report = cache.invalidate_role("admin", &source).await.unwrap();
    assert!(report.immediate);
    assert_eq!(report.l2_removed, 2);
    assert_eq!(report.queued, 0);
    assert!(cache.queue().is_empty());

    let events = h.monitor.events_named("permission_cache_invalidated");
    let last = events.last().unwrap();
    assert_eq!(last.get("level").map(String::as_str), Some("role"));
}

#[tokio::test]
async fn test_malformed_tasks_are_skipped() {
    let h = harness(AppConfig::default());
    let cache = h.system.cache();
    cache.set("u1", &Scope::Global, perms(&["a"]), None).await;

    cache.add_delayed_invalidation("not-a-cache-key", InvalidationLevel::L2, "test");
    cache.add_delayed_invalidation("other:perm:{u1}:global", InvalidationLevel::L2, "test");
    cache.add_delayed_invalidation(
        cache.entry_key("u1", &Scope::Global),
        InvalidationLevel::L2,
        "test",
    );

    let report = h.system.worker().flush().await;
    assert_eq!(report.drained, 3);
    assert_eq!(report.malformed, 2);
    assert_eq!(report.applied, 1);
    assert!(!h.store.contains_key(&cache.entry_key("u1", &Scope::Global)));
    assert_eq!(cache.queue().stats().malformed, 2);
}

#[tokio::test]
async fn test_shutdown_flushes_remaining_tasks() {
    let h = harness(AppConfig::default());
    let cache = h.system.cache();
    cache.set("u9", &Scope::server("s"), perms(&["x"]), None).await;
    cache.add_delayed_invalidation(
        cache.keys().subject_index("u9"),
        InvalidationLevel::L2,
        "test",
    );

    assert!(h.system.start());
    h.system.shutdown().await;

    assert!(cache.queue().is_empty());
    assert!(!h.store.contains_key(&cache.entry_key("u9", &Scope::server("s"))));
}
