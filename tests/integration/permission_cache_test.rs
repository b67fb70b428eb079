//! Two processes sharing one distributed store

use lighter_permission_cache::cache::PermissionSet;
use lighter_permission_cache::clock::ManualClock;
use lighter_permission_cache::collaborators::null_monitor;
use lighter_permission_cache::config::AppConfig;
use lighter_permission_cache::keys::Scope;
use lighter_permission_cache::store::MemoryStore;
use lighter_permission_cache::testing::StaticPermissionSource;
use lighter_permission_cache::PermissionCacheSystem;
use std::sync::Arc;
use std::time::Duration;

struct Pair {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    a: PermissionCacheSystem,
    b: PermissionCacheSystem,
}

fn pair() -> Pair {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let process = || {
        PermissionCacheSystem::with_store(
            AppConfig::default(),
            store.clone(),
            clock.clone(),
            null_monitor(),
        )
    };
    let (a, b) = (process(), process());
    Pair { clock, store, a, b }
}

fn perms(names: &[&str]) -> PermissionSet {
    names.iter().copied().collect()
}

#[tokio::test]
async fn test_write_in_one_process_is_read_in_another() {
    let p = pair();
    let scope = Scope::server("guild-7");
    p.a.cache()
        .set("u1", &scope, perms(&["messages.read", "messages.write"]), None)
        .await;

    assert_eq!(
        p.b.cache().get("u1", &scope).await,
        Some(perms(&["messages.read", "messages.write"]))
    );
    assert_eq!(p.b.cache().stats().l2.hits, 1);
    assert_eq!(p.b.cache().get("u2", &scope).await, None);
    assert_eq!(p.b.cache().stats().l2.misses, 1);
}

#[tokio::test]
async fn test_invalidation_reaches_other_process_after_its_l1_lifetime() {
    let p = pair();
    let scope = Scope::Global;
    p.a.cache().set("u1", &scope, perms(&["a"]), None).await;
    assert!(p.b.cache().get("u1", &scope).await.is_some());

    let report = p.a.cache().invalidate_subject("u1").await;
    assert_eq!(report.l2_removed, Some(1));
    assert!(!report.queued);
    assert_eq!(p.a.cache().get("u1", &scope).await, None);

    // B still serves its own L1 copy until it expires
    assert!(p.b.cache().get("u1", &scope).await.is_some());
    p.clock.advance(Duration::from_millis(60_000));
    assert_eq!(p.b.cache().get("u1", &scope).await, None);
}

#[tokio::test]
async fn test_concurrent_misses_compute_once() {
    let p = pair();
    let scope = Scope::channel("c1");
    let source = StaticPermissionSource::new().with_permissions("u1", ["view", "speak"]);

    let (from_a, from_b) = tokio::join!(
        p.a.cache().get_or_compute("u1", &scope, &source),
        p.b.cache().get_or_compute("u1", &scope, &source),
    );
    assert_eq!(from_a.unwrap(), perms(&["view", "speak"]));
    assert_eq!(from_b.unwrap(), perms(&["view", "speak"]));
    assert_eq!(source.compute_calls(), 1);

    assert!(p.a.cache().has_permission("u1", &scope, "speak", &source).await.unwrap());
    assert!(!p.b.cache().has_permission("u1", &scope, "kick", &source).await.unwrap());
    assert_eq!(source.compute_calls(), 1);
}

#[tokio::test]
async fn test_recompute_after_invalidation() {
    let p = pair();
    let scope = Scope::Global;
    let source = StaticPermissionSource::new().with_permissions("u1", ["read"]);

    p.a.cache().get_or_compute("u1", &scope, &source).await.unwrap();
    p.a.cache().invalidate_key("u1", &scope).await;
    p.b.cache().get_or_compute("u1", &scope, &source).await.unwrap();

    assert_eq!(source.compute_calls(), 2);
}

#[tokio::test]
async fn test_batch_get_mixes_levels() {
    let p = pair();
    let scope = Scope::server("s1");
    p.a.cache().set("u1", &scope, perms(&["a"]), None).await;
    p.a.cache().set("u2", &scope, perms(&["b"]), None).await;
    p.b.cache().set("u3", &scope, perms(&["c"]), None).await;

    let subjects: Vec<String> = ["u1", "u2", "u3", "u4"].iter().map(|s| s.to_string()).collect();
    let before = p.store.round_trips();
    let found = p.b.cache().batch_get(&subjects, &scope).await;

    assert_eq!(found.len(), 3);
    assert_eq!(found.get("u1"), Some(&perms(&["a"])));
    assert_eq!(found.get("u3"), Some(&perms(&["c"])));
    assert!(!found.contains_key("u4"));
    // u3 came from L1; u1, u2 and u4 share one read. The rest is the
    // breaker check, the rate limit and the breaker success.
    assert_eq!(p.store.round_trips() - before, 4);
}

#[tokio::test]
async fn test_reset_in_one_process_keeps_shared_entries() {
    let p = pair();
    let scope = Scope::Global;
    p.a.cache().set("u1", &scope, perms(&["a"]), None).await;

    p.a.reset();
    assert!(p.a.cache().local().is_empty());
    assert_eq!(p.b.cache().get("u1", &scope).await, Some(perms(&["a"])));
    assert_eq!(p.a.cache().get("u1", &scope).await, Some(perms(&["a"])));
}
