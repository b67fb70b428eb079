use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{CacheEntry, CacheStats, PermissionSet};
use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::keys::CacheKey;

/// Entries inspected when choosing a victim on a full cache
const EVICTION_SAMPLE: usize = 32;

type Entries = DashMap<CacheKey, CacheEntry>;
type SubjectIndex = DashMap<String, HashSet<CacheKey>>;

/// L1: per-process permission cache using DashMap
///
/// Entries expire by the injected clock. A per-subject index lets subject
/// invalidation remove every scope without scanning the map.
#[derive(Debug)]
pub struct LocalCache {
    /// DashMap storage with configurable shards
    store: Arc<Entries>,
    /// Subject id to every key cached for it
    subjects: Arc<SubjectIndex>,
    clock: SharedClock,
    max_entries: usize,
    /// Cache hit counter
    hits: Arc<AtomicU64>,
    /// Cache miss counter
    misses: Arc<AtomicU64>,
    /// Eviction counter
    evictions: Arc<AtomicU64>,
    /// Background cleanup task handle
    cleanup_handle: Option<JoinHandle<()>>,
}

impl LocalCache {
    /// Create a LocalCache with default shard count (CPU count * 4)
    pub fn new(clock: SharedClock, max_entries: usize) -> Self {
        Self::with_shard_count(clock, max_entries, num_cpus::get() * 4)
    }

    /// Create a LocalCache with specific shard count
    pub fn with_shard_count(clock: SharedClock, max_entries: usize, shard_count: usize) -> Self {
        Self {
            store: Arc::new(DashMap::with_shard_amount(shard_count.next_power_of_two().max(2))),
            subjects: Arc::new(DashMap::new()),
            clock,
            max_entries: max_entries.max(1),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            evictions: Arc::new(AtomicU64::new(0)),
            cleanup_handle: None,
        }
    }

    /// Create from configuration, with the periodic cleanup running when a
    /// runtime is available
    pub fn from_config(config: &CacheConfig, clock: SharedClock) -> Self {
        Self::new(clock, config.l1_max_entries).with_cleanup(config.l1_cleanup_interval())
    }

    /// Start a background task removing expired entries every `interval`
    pub fn with_cleanup(mut self, interval: Duration) -> Self {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No runtime, L1 expiry is lazy only");
            return self;
        };

        let store = Arc::clone(&self.store);
        let subjects = Arc::clone(&self.subjects);
        let evictions = Arc::clone(&self.evictions);
        let clock = self.clock.clone();

        self.cleanup_handle = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let removed = purge(&store, &subjects, clock.now_millis());
                if removed > 0 {
                    evictions.fetch_add(removed as u64, Ordering::Relaxed);
                    tracing::debug!(removed, "Expired L1 entries removed");
                }
            }
        }));
        self
    }

    /// Cached permissions for `key`, counting a hit or a miss
    pub fn get(&self, key: &CacheKey) -> Option<PermissionSet> {
        let now = self.clock.now_millis();

        if let Some(entry) = self.store.get(key) {
            if !entry.is_expired(now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.permissions.clone());
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // Expired: remove lazily
        if self.remove(key) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Like [`Self::get`] without touching the counters
    pub fn peek(&self, key: &CacheKey) -> Option<PermissionSet> {
        let now = self.clock.now_millis();
        self.store
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.permissions.clone())
    }

    /// Whether a live entry exists, without touching the counters
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = self.clock.now_millis();
        self.store
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Insert or replace the entry for `key`
    pub fn insert(&self, key: CacheKey, permissions: PermissionSet, ttl: Duration) {
        let now = self.clock.now_millis();

        if !self.store.contains_key(&key) && self.store.len() >= self.max_entries {
            self.make_room(now);
        }

        self.subjects
            .entry(key.subject_id.clone())
            .or_default()
            .insert(key.clone());
        self.store.insert(key, CacheEntry::new(permissions, now, ttl));
    }

    /// Drop expired entries, then the sampled entry closest to expiry
    fn make_room(&self, now: u64) {
        let removed = purge(&self.store, &self.subjects, now);
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        if self.store.len() < self.max_entries {
            return;
        }

        let victim = self
            .store
            .iter()
            .take(EVICTION_SAMPLE)
            .min_by_key(|entry| entry.value().expires_at_ms())
            .map(|entry| entry.key().clone());

        if let Some(victim) = victim {
            if self.remove(&victim) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove one entry; true if it existed
    pub fn remove(&self, key: &CacheKey) -> bool {
        unindex(&self.subjects, key);
        self.store.remove(key).is_some()
    }

    /// Remove every entry of a subject, returning how many existed
    pub fn remove_subject(&self, subject_id: &str) -> usize {
        let Some((_, keys)) = self.subjects.remove(subject_id) else {
            return 0;
        };
        keys.iter()
            .filter(|key| self.store.remove(*key).is_some())
            .count()
    }

    /// Keys currently indexed for a subject
    pub fn keys_for_subject(&self, subject_id: &str) -> Vec<CacheKey> {
        self.subjects
            .get(subject_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove every expired entry now
    pub fn purge_expired(&self) -> usize {
        let removed = purge(&self.store, &self.subjects, self.clock.now_millis());
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn clear(&self) {
        self.store.clear();
        self.subjects.clear();
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.store.len(),
            hit_rate: 0.0,
        };
        stats.calculate_hit_rate();
        stats
    }
}

impl Drop for LocalCache {
    fn drop(&mut self) {
        // Abort cleanup task when LocalCache is dropped
        if let Some(handle) = self.cleanup_handle.take() {
            handle.abort();
        }
    }
}

fn unindex(subjects: &SubjectIndex, key: &CacheKey) {
    let now_empty = match subjects.get_mut(&key.subject_id) {
        Some(mut keys) => {
            keys.remove(key);
            keys.is_empty()
        }
        None => false,
    };
    if now_empty {
        subjects.remove_if(&key.subject_id, |_, keys| keys.is_empty());
    }
}

fn purge(store: &Entries, subjects: &SubjectIndex, now: u64) -> usize {
    let expired: Vec<CacheKey> = store
        .iter()
        .filter(|entry| entry.value().is_expired(now))
        .map(|entry| entry.key().clone())
        .collect();

    let mut removed = 0;
    for key in expired {
        if store.remove_if(&key, |_, entry| entry.is_expired(now)).is_some() {
            unindex(subjects, &key);
            removed += 1;
        }
    }
    removed
}
