use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::{CacheEntry, L2Stats, LocalCache, PermissionCacheStats, PermissionSet, codec};
use crate::clock::SharedClock;
use crate::collaborators::{PermissionSource, SharedMonitor};
use crate::config::CacheConfig;
use crate::invalidation::{InvalidationExecutor, InvalidationLevel, InvalidationQueue};
use crate::keys::{CacheKey, KeySpace, ParsedKey, Scope};
use crate::lock::{DistributedLock, LockOptions};
use crate::resilience::{Bulkhead, GuardError, ResilienceGuard, ResilienceRegistry};
use crate::store::{SharedStore, StoreError, StoreResult};

/// Result of a cache write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    /// The entry reached the distributed store
    pub l2_written: bool,
    /// The L2 payload was compressed
    pub compressed: bool,
    /// Lifetime given to the L1 copy
    pub l1_ttl: Duration,
}

/// Result of invalidating one subject or one entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub l1_removed: usize,
    /// Entries deleted from the store; `None` when the delete was queued
    pub l2_removed: Option<u64>,
    /// The L2 delete was handed to the delayed invalidation queue
    pub queued: bool,
}

/// Result of invalidating every subject holding a role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoleInvalidationReport {
    pub subjects: usize,
    pub l1_removed: usize,
    pub l2_removed: u64,
    /// Subjects whose L2 entries were left to the queue
    pub queued: usize,
    /// Fan-out was small enough to delete from the store right away
    pub immediate: bool,
}

#[derive(Debug, Default)]
struct L2Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
    writes: AtomicU64,
}

impl L2Counters {
    fn snapshot(&self) -> L2Stats {
        L2Stats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

/// Hybrid permission cache with a per-process L1 and a shared L2
///
/// ## Architecture
/// - **L1**: [`LocalCache`], fast in-memory map
/// - **L2**: the distributed store, every call guarded by the configured
///   circuit breaker and rate limiter
///
/// ## Cache Strategy
/// - **get()**: L1 first with no store round trip; on a miss take the
///   population lock, re-check L1, read L2 and backfill L1
/// - **set()**: write L1, then L2 together with the subject index
/// - **invalidate_subject()**: drop L1 entries, delete the subject index in
///   L2; a failed delete goes to the delayed invalidation queue
/// - **invalidate_role()**: fan out over the subjects holding the role,
///   queueing L2 deletes past a threshold
///
/// ## Error Handling
/// L2 failures never fail a read or a write. While L2 is unavailable the
/// cache serves from L1 with a shorter lifetime and callers recompute on a
/// miss.
pub struct PermissionCache {
    l1: LocalCache,
    store: SharedStore,
    keys: KeySpace,
    config: CacheConfig,
    clock: SharedClock,
    monitor: SharedMonitor,
    guard: ResilienceGuard,
    recompute_bulkhead: Option<Arc<Bulkhead>>,
    queue: Arc<InvalidationQueue>,
    lock_options: LockOptions,
    l2: L2Counters,
    degraded: AtomicBool,
}

impl PermissionCache {
    /// Build the cache on the registry's store, clock and monitor
    pub fn new(
        config: CacheConfig,
        registry: &ResilienceRegistry,
        queue: Arc<InvalidationQueue>,
    ) -> Self {
        let context = registry.context();

        let mut guard = registry.guard();
        if let Some(name) = &config.l2_circuit_breaker {
            guard = guard.circuit_breaker(name);
        }
        if let Some(name) = &config.l2_rate_limiter {
            guard = guard.rate_limiter(name);
        }

        Self {
            l1: LocalCache::from_config(&config, context.clock.clone()),
            store: context.store.clone(),
            keys: KeySpace::new(config.key_prefix.clone()),
            clock: context.clock.clone(),
            monitor: context.monitor.clone(),
            guard: guard.build(),
            recompute_bulkhead: config
                .recompute_bulkhead
                .as_deref()
                .map(|name| registry.bulkhead(name)),
            queue,
            lock_options: LockOptions::from(&config),
            l2: L2Counters::default(),
            degraded: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn local(&self) -> &LocalCache {
        &self.l1
    }

    pub fn queue(&self) -> &Arc<InvalidationQueue> {
        &self.queue
    }

    /// Whether the last L2 call failed or was turned away
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Rendered L2 key of one entry
    pub fn entry_key(&self, subject_id: &str, scope: &Scope) -> String {
        self.keys.entry(&CacheKey::new(subject_id, scope.clone()))
    }

    fn l1_ttl(&self, l2_ttl: Duration) -> Duration {
        let base = if self.is_degraded() {
            self.config.degraded_l1_ttl()
        } else {
            self.config.l1_ttl()
        };
        base.min(l2_ttl)
    }

    fn mark_degraded(&self, degraded: bool) {
        let was = self.degraded.swap(degraded, Ordering::Relaxed);
        if was == degraded {
            return;
        }
        if degraded {
            tracing::warn!(
                backend = self.store.backend(),
                "L2 unavailable, serving from L1 with the degraded lifetime"
            );
            self.monitor.record_event(
                "permission_cache_degraded",
                &[("backend", self.store.backend().to_string())],
            );
        } else {
            tracing::info!(backend = self.store.backend(), "L2 available again");
            self.monitor.record_event(
                "permission_cache_recovered",
                &[("backend", self.store.backend().to_string())],
            );
        }
    }

    /// Run one L2 call under the guard, tracking availability
    async fn guarded<F, Fut, T>(&self, operation: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        match self.guard.call(f).await {
            Ok(value) => {
                self.mark_degraded(false);
                Ok(value)
            }
            Err(GuardError::Inner(e)) => {
                self.l2.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(operation, error = %e, "L2 call failed, continuing with L1 only");
                self.mark_degraded(true);
                Err(e)
            }
            Err(rejected) => {
                self.l2.skipped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(operation, reason = %rejected, "L2 call skipped");
                if matches!(rejected, GuardError::CircuitOpen { .. }) {
                    self.mark_degraded(true);
                }
                Err(StoreError::Unavailable(rejected.to_string()))
            }
        }
    }

    /// Decode an L2 payload and backfill L1 with it
    fn accept_l2(&self, key: &CacheKey, bytes: &[u8]) -> Option<PermissionSet> {
        let entry = match codec::decode(bytes) {
            Ok(entry) => entry,
            Err(e) => {
                self.l2.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(cache_key = %key, error = %e, "Discarding undecodable L2 entry");
                return None;
            }
        };

        let now = self.clock.now_millis();
        if entry.is_expired(now) {
            self.l2.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.l2.hits.fetch_add(1, Ordering::Relaxed);
        let remaining = Duration::from_millis(entry.expires_at_ms() - now);
        self.l1
            .insert(key.clone(), entry.permissions.clone(), self.l1_ttl(remaining));
        Some(entry.permissions)
    }

    async fn read_l2(&self, key: &CacheKey) -> Option<PermissionSet> {
        let rendered = self.keys.entry(key);
        match self.guarded("get", || self.store.get(&rendered)).await {
            Ok(Some(bytes)) => {
                let found = self.accept_l2(key, &bytes);
                if found.is_some() {
                    tracing::debug!(cache_key = %key, "L2 cache hit, backfilled L1");
                }
                found
            }
            Ok(None) => {
                self.l2.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache_key = %key, "L2 cache miss");
                None
            }
            Err(_) => None,
        }
    }

    /// Cached permissions of a subject in a scope.
    ///
    /// An L1 hit returns without touching the store. On a miss the read of
    /// L2 happens under the entry's population lock; if the lock cannot be
    /// taken the read goes ahead unlocked.
    #[tracing::instrument(skip(self, scope), fields(subject = %subject_id, scope = %scope))]
    pub async fn get(&self, subject_id: &str, scope: &Scope) -> Option<PermissionSet> {
        let key = CacheKey::new(subject_id, scope.clone());
        if let Some(permissions) = self.l1.get(&key) {
            tracing::debug!("L1 cache hit");
            return Some(permissions);
        }

        let lock = DistributedLock::new(
            self.store.clone(),
            self.keys.entry_lock(&key),
            self.lock_options,
        );
        let locked = lock.acquire().await;

        let found = match locked.then(|| self.l1.peek(&key)).flatten() {
            Some(permissions) => Some(permissions),
            None => self.read_l2(&key).await,
        };

        if locked {
            lock.release().await;
        }
        found
    }

    /// Read many subjects in one scope with a single L2 round trip
    #[tracing::instrument(skip(self, subject_ids, scope), fields(count = subject_ids.len(), scope = %scope))]
    pub async fn batch_get(
        &self,
        subject_ids: &[String],
        scope: &Scope,
    ) -> HashMap<String, PermissionSet> {
        let mut found = HashMap::with_capacity(subject_ids.len());
        let mut missing = Vec::new();

        for subject_id in subject_ids {
            let key = CacheKey::new(subject_id.as_str(), scope.clone());
            match self.l1.get(&key) {
                Some(permissions) => {
                    found.insert(subject_id.clone(), permissions);
                }
                None => missing.push(key),
            }
        }

        if missing.is_empty() {
            return found;
        }

        let rendered: Vec<String> = missing.iter().map(|key| self.keys.entry(key)).collect();
        let Ok(values) = self.guarded("get_many", || self.store.get_many(&rendered)).await else {
            return found;
        };

        for (key, value) in missing.into_iter().zip(values) {
            match value {
                Some(bytes) => {
                    if let Some(permissions) = self.accept_l2(&key, &bytes) {
                        found.insert(key.subject_id.clone(), permissions);
                    }
                }
                None => {
                    self.l2.misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        found
    }

    /// Write permissions to both levels.
    ///
    /// `ttl` defaults to the configured L2 lifetime. The L1 copy never
    /// outlives the L2 one.
    #[tracing::instrument(skip(self, scope, permissions), fields(subject = %subject_id, scope = %scope, count = permissions.len()))]
    pub async fn set(
        &self,
        subject_id: &str,
        scope: &Scope,
        permissions: PermissionSet,
        ttl: Option<Duration>,
    ) -> WriteOutcome {
        let key = CacheKey::new(subject_id, scope.clone());
        let l2_ttl = ttl.unwrap_or_else(|| self.config.l2_ttl());
        let l1_ttl = self.l1_ttl(l2_ttl);

        self.l1.insert(key.clone(), permissions.clone(), l1_ttl);

        let entry = CacheEntry::new(permissions, self.clock.now_millis(), l2_ttl);
        let payload = match codec::encode(&entry, self.config.compression_threshold) {
            Ok(payload) => payload,
            Err(e) => {
                self.l2.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Failed to encode cache entry, L1 only");
                return WriteOutcome {
                    l2_written: false,
                    compressed: false,
                    l1_ttl,
                };
            }
        };

        let rendered = self.keys.entry(&key);
        let index = self.keys.subject_index(subject_id);
        let l2_written = self
            .guarded("set", || {
                self.store.set_indexed(&rendered, &payload, l2_ttl, &index)
            })
            .await
            .is_ok();

        if l2_written {
            self.l2.writes.fetch_add(1, Ordering::Relaxed);
        }

        WriteOutcome {
            l2_written,
            compressed: codec::is_compressed(&payload),
            l1_ttl,
        }
    }

    /// Cached permissions, computed from `source` on a miss.
    ///
    /// The computation runs under the entry's population lock with lease
    /// renewal, so concurrent misses across processes compute once; callers
    /// that lose the race find the winner's entry when they get the lock.
    #[tracing::instrument(skip(self, scope, source), fields(subject = %subject_id, scope = %scope))]
    pub async fn get_or_compute(
        &self,
        subject_id: &str,
        scope: &Scope,
        source: &dyn PermissionSource,
    ) -> anyhow::Result<PermissionSet> {
        let key = CacheKey::new(subject_id, scope.clone());
        if let Some(permissions) = self.l1.get(&key) {
            return Ok(permissions);
        }

        let options = match self.config.lock_renew_interval() {
            Some(every) => self.lock_options.with_renewal(every),
            None => self.lock_options,
        };
        let lock = DistributedLock::new(self.store.clone(), self.keys.entry_lock(&key), options);
        let locked = lock.acquire().await;
        if !locked {
            tracing::debug!("Population lock not acquired, computing without it");
        }

        let result: anyhow::Result<PermissionSet> = async {
            if let Some(permissions) = locked.then(|| self.l1.peek(&key)).flatten() {
                return Ok(permissions);
            }
            if let Some(permissions) = self.read_l2(&key).await {
                return Ok(permissions);
            }

            let permissions = match &self.recompute_bulkhead {
                Some(bulkhead) => {
                    bulkhead
                        .run(source.compute_permissions(subject_id, scope))
                        .await??
                }
                None => source.compute_permissions(subject_id, scope).await?,
            };
            self.set(subject_id, scope, permissions.clone(), None).await;
            Ok(permissions)
        }
        .await;

        if locked {
            lock.release().await;
        }
        result
    }

    /// Whether the subject holds `permission` in the scope
    pub async fn has_permission(
        &self,
        subject_id: &str,
        scope: &Scope,
        permission: &str,
        source: &dyn PermissionSource,
    ) -> anyhow::Result<bool> {
        let permissions = self.get_or_compute(subject_id, scope, source).await?;
        Ok(permissions.contains(permission))
    }

    /// Drop every cached entry of a subject, in every scope
    #[tracing::instrument(skip(self), fields(subject = %subject_id))]
    pub async fn invalidate_subject(&self, subject_id: &str) -> InvalidationReport {
        let l1_removed = self.l1.remove_subject(subject_id);
        let index = self.keys.subject_index(subject_id);

        let report = match self
            .guarded("delete_indexed", || self.store.delete_indexed(&index))
            .await
        {
            Ok(removed) => InvalidationReport {
                l1_removed,
                l2_removed: Some(removed),
                queued: false,
            },
            Err(_) => {
                self.queue
                    .push(index, InvalidationLevel::L2, "subject_invalidation_retry");
                InvalidationReport {
                    l1_removed,
                    l2_removed: None,
                    queued: true,
                }
            }
        };

        tracing::info!(
            l1_removed = report.l1_removed,
            l2_removed = ?report.l2_removed,
            queued = report.queued,
            "Subject invalidated"
        );
        self.monitor.record_event(
            "permission_cache_invalidated",
            &[
                ("level", "subject".to_string()),
                ("queued", report.queued.to_string()),
            ],
        );
        report
    }

    /// Drop one entry
    #[tracing::instrument(skip(self, scope), fields(subject = %subject_id, scope = %scope))]
    pub async fn invalidate_key(&self, subject_id: &str, scope: &Scope) -> InvalidationReport {
        let key = CacheKey::new(subject_id, scope.clone());
        let l1_removed = usize::from(self.l1.remove(&key));
        let entry = self.keys.entry(&key);
        let rendered = vec![entry.clone()];

        match self.guarded("delete", || self.store.delete(&rendered)).await {
            Ok(removed) => InvalidationReport {
                l1_removed,
                l2_removed: Some(removed),
                queued: false,
            },
            Err(_) => {
                self.queue
                    .push(entry, InvalidationLevel::L2, "key_invalidation_retry");
                InvalidationReport {
                    l1_removed,
                    l2_removed: None,
                    queued: true,
                }
            }
        }
    }

    /// Drop the entries of every subject holding `role_id`.
    ///
    /// L1 is cleared right away. L2 deletes run inline up to
    /// `role_fanout_threshold` subjects and are queued beyond it.
    #[tracing::instrument(skip(self, source), fields(role = %role_id))]
    pub async fn invalidate_role(
        &self,
        role_id: &str,
        source: &dyn PermissionSource,
    ) -> anyhow::Result<RoleInvalidationReport> {
        let subjects = source.subjects_with_role(role_id).await?;
        let immediate = subjects.len() <= self.config.role_fanout_threshold;

        let mut report = RoleInvalidationReport {
            subjects: subjects.len(),
            immediate,
            ..RoleInvalidationReport::default()
        };

        for subject_id in &subjects {
            report.l1_removed += self.l1.remove_subject(subject_id);
            let index = self.keys.subject_index(subject_id);

            if immediate {
                if let Ok(removed) = self
                    .guarded("delete_indexed", || self.store.delete_indexed(&index))
                    .await
                {
                    report.l2_removed += removed;
                    continue;
                }
            }

            self.queue
                .push(index, InvalidationLevel::L2, "role_invalidation");
            report.queued += 1;
        }

        tracing::info!(
            subjects = report.subjects,
            l1_removed = report.l1_removed,
            l2_removed = report.l2_removed,
            queued = report.queued,
            "Role invalidated"
        );
        self.monitor.record_event(
            "permission_cache_invalidated",
            &[
                ("level", "role".to_string()),
                ("queued", (report.queued > 0).to_string()),
            ],
        );
        Ok(report)
    }

    /// Queue an invalidation of a rendered entry or subject index key
    pub fn add_delayed_invalidation(
        &self,
        cache_key: impl Into<String>,
        level: InvalidationLevel,
        reason: impl Into<String>,
    ) -> bool {
        self.queue.push(cache_key, level, reason)
    }

    /// Drop everything held in L1
    pub fn clear_local(&self) {
        self.l1.clear();
    }

    pub fn stats(&self) -> PermissionCacheStats {
        let l1 = self.l1.stats();
        let l2 = self.l2.snapshot();

        let lookups = l1.hits + l1.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            (l1.hits + l2.hits) as f64 / lookups as f64
        };

        PermissionCacheStats { l1, l2, hit_rate }
    }
}

impl std::fmt::Debug for PermissionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionCache")
            .field("l1", &self.l1)
            .field("backend", &self.store.backend())
            .field("keys", &self.keys)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

#[async_trait]
impl InvalidationExecutor for PermissionCache {
    fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    async fn execute(&self, level: InvalidationLevel, keys: &[ParsedKey]) -> StoreResult<u64> {
        match level {
            InvalidationLevel::L1 => {
                let removed = keys
                    .iter()
                    .map(|key| match key {
                        ParsedKey::Entry(key) => usize::from(self.l1.remove(key)),
                        ParsedKey::SubjectIndex(subject_id) => self.l1.remove_subject(subject_id),
                    })
                    .sum::<usize>();
                Ok(removed as u64)
            }
            InvalidationLevel::L2 => {
                let mut entries = Vec::new();
                let mut removed = 0;

                for key in keys {
                    match key {
                        ParsedKey::Entry(key) => entries.push(self.keys.entry(key)),
                        ParsedKey::SubjectIndex(subject_id) => {
                            let index = self.keys.subject_index(subject_id);
                            removed += self
                                .guarded("delete_indexed", || self.store.delete_indexed(&index))
                                .await?;
                        }
                    }
                }

                if !entries.is_empty() {
                    removed += self
                        .guarded("delete", || self.store.delete(&entries))
                        .await?;
                }
                Ok(removed)
            }
        }
    }
}
