// Unit tests for the L1 cache and the L2 entry codec

use lighter_permission_cache::cache::{CacheEntry, LocalCache, PermissionSet, codec};
use lighter_permission_cache::clock::ManualClock;
use lighter_permission_cache::keys::{CacheKey, Scope};
use std::sync::Arc;
use std::time::Duration;

fn perms(names: &[&str]) -> PermissionSet {
    names.iter().copied().collect()
}

fn local(max_entries: usize) -> (Arc<ManualClock>, LocalCache) {
    let clock = Arc::new(ManualClock::new(0));
    (clock.clone(), LocalCache::with_shard_count(clock, max_entries, 4))
}

// ============================================================================
// LocalCache Tests
// ============================================================================

#[test]
fn test_local_cache_insert_and_get() {
    let (_clock, cache) = local(100);
    let key = CacheKey::new("u1", Scope::server("s1"));

    cache.insert(key.clone(), perms(&["read", "write"]), Duration::from_secs(60));
    assert_eq!(cache.get(&key), Some(perms(&["read", "write"])));
    assert_eq!(cache.get(&CacheKey::new("u1", Scope::Global)), None);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hit_rate, 0.5);
}

#[test]
fn test_local_cache_expires_by_clock() {
    let (clock, cache) = local(100);
    let key = CacheKey::new("u1", Scope::Global);
    cache.insert(key.clone(), perms(&["a"]), Duration::from_millis(500));

    clock.advance(Duration::from_millis(499));
    assert!(cache.contains(&key));

    clock.advance(Duration::from_millis(1));
    assert!(!cache.contains(&key));
    assert_eq!(cache.get(&key), None);
    assert_eq!(cache.purge_expired(), 1);
    assert!(cache.is_empty());
}

#[test]
fn test_local_cache_replaces_whole_sets() {
    let (_clock, cache) = local(100);
    let key = CacheKey::new("u1", Scope::Global);

    cache.insert(key.clone(), perms(&["a", "b"]), Duration::from_secs(60));
    cache.insert(key.clone(), perms(&["c"]), Duration::from_secs(60));

    assert_eq!(cache.get(&key), Some(perms(&["c"])));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_local_cache_subject_removal_spans_scopes() {
    let (_clock, cache) = local(100);
    for scope in [Scope::Global, Scope::server("1"), Scope::channel("2")] {
        cache.insert(CacheKey::new("u1", scope), perms(&["a"]), Duration::from_secs(60));
    }
    cache.insert(CacheKey::new("u2", Scope::Global), perms(&["a"]), Duration::from_secs(60));

    assert_eq!(cache.keys_for_subject("u1").len(), 3);
    assert_eq!(cache.remove_subject("u1"), 3);
    assert_eq!(cache.remove_subject("u1"), 0);
    assert!(cache.keys_for_subject("u1").is_empty());
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_local_cache_stays_within_capacity() {
    let (_clock, cache) = local(10);
    for i in 0..25 {
        cache.insert(
            CacheKey::new(format!("u{}", i), Scope::Global),
            perms(&["a"]),
            Duration::from_secs(60 + i),
        );
    }

    assert_eq!(cache.len(), 10);
    assert_eq!(cache.stats().evictions, 15);
}

#[tokio::test]
async fn test_local_cache_concurrent_access() {
    let (_clock, cache) = local(10_000);
    let cache = Arc::new(cache);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                for i in 0..100 {
                    let key = CacheKey::new(format!("u{}-{}", t, i), Scope::Global);
                    cache.insert(key.clone(), perms(&["a"]), Duration::from_secs(60));
                    assert!(cache.get(&key).is_some());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(cache.len(), 800);
    assert_eq!(cache.stats().hits, 800);
}

// ============================================================================
// Codec Tests
// ============================================================================

#[test]
fn test_codec_small_entries_stay_raw() {
    let entry = CacheEntry::new(perms(&["read"]), 1_000, Duration::from_secs(60));
    let bytes = codec::encode(&entry, 1024).unwrap();

    assert!(!codec::is_compressed(&bytes));
    assert_eq!(codec::decode(&bytes).unwrap(), entry);
}

#[test]
fn test_codec_large_entries_are_compressed_and_smaller() {
    let many: PermissionSet = (0..1_000).map(|i| format!("guild.channel.permission.{}", i)).collect();
    let entry = CacheEntry::new(many, 1_000, Duration::from_secs(60));

    let raw = codec::encode(&entry, usize::MAX).unwrap();
    let compressed = codec::encode(&entry, 64).unwrap();

    assert!(codec::is_compressed(&compressed));
    assert!(compressed.len() < raw.len());
    assert_eq!(codec::decode(&compressed).unwrap(), entry);
}

#[test]
fn test_codec_rejects_garbage() {
    assert!(codec::decode(&[]).is_err());
    assert!(codec::decode(&[7, 1, 2, 3]).is_err());
    assert!(codec::decode(&[1, 0xde, 0xad]).is_err());
}

#[test]
fn test_entry_expiry_boundaries() {
    let entry = CacheEntry::new(PermissionSet::new(), 1_000, Duration::from_millis(500));
    assert_eq!(entry.expires_at_ms(), 1_500);
    assert!(!entry.is_expired(1_499));
    assert!(entry.is_expired(1_500));
}
