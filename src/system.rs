//! Composition root
//!
//! [`PermissionCacheSystem`] wires the store, the resilience registry, the
//! permission cache and the invalidation worker from one [`AppConfig`]. It
//! owns every registry; nothing in the crate is a global.

use anyhow::Context;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::cache::PermissionCache;
use crate::clock::{SharedClock, SystemClock};
use crate::collaborators::SharedMonitor;
use crate::config::{AppConfig, Validate};
use crate::invalidation::{InvalidationQueue, InvalidationWorker, WorkerHandle};
use crate::keys::KeySpace;
use crate::resilience::{ResilienceContext, ResilienceRegistry};
use crate::store::{MemoryStore, RedisStore, SharedStore};

/// Everything a process needs to serve cached permissions
pub struct PermissionCacheSystem {
    config: AppConfig,
    store: SharedStore,
    registry: Arc<ResilienceRegistry>,
    cache: Arc<PermissionCache>,
    worker: Arc<InvalidationWorker>,
    worker_handle: Mutex<Option<WorkerHandle>>,
}

impl PermissionCacheSystem {
    /// Validate the configuration, connect the store and build every part.
    ///
    /// With `redis.enabled = false` the in-memory store is used.
    pub async fn connect(config: AppConfig, monitor: SharedMonitor) -> anyhow::Result<Self> {
        config.validate()?;

        let store: SharedStore = if config.redis.enabled {
            let store = RedisStore::with_timeout(
                &config.redis.url,
                config.redis.connect_timeout(),
                config.redis.operation_timeout(),
            )
            .await
            .context("Failed to connect the distributed store")?;
            Arc::new(store)
        } else {
            tracing::warn!("Redis disabled, using the process-local in-memory store");
            Arc::new(MemoryStore::new())
        };

        Ok(Self::with_store(config, store, Arc::new(SystemClock), monitor))
    }

    /// Build on an existing store and clock
    pub fn with_store(
        config: AppConfig,
        store: SharedStore,
        clock: SharedClock,
        monitor: SharedMonitor,
    ) -> Self {
        let context = ResilienceContext::new(
            store.clone(),
            KeySpace::new(config.cache.key_prefix.clone()),
            clock.clone(),
            monitor.clone(),
            config.resilience.clone(),
        );
        let registry = Arc::new(ResilienceRegistry::new(context));

        let queue = Arc::new(InvalidationQueue::new(
            config.invalidation.max_queue_len,
            clock.clone(),
        ));
        let cache = Arc::new(PermissionCache::new(
            config.cache.clone(),
            &registry,
            queue.clone(),
        ));
        let worker = Arc::new(InvalidationWorker::new(
            queue,
            cache.clone(),
            config.invalidation.clone(),
            clock,
            monitor,
        ));

        tracing::info!(
            app = %config.app.name,
            environment = %config.app.environment,
            backend = store.backend(),
            "Permission cache system ready"
        );

        Self {
            config,
            store,
            registry,
            cache,
            worker,
            worker_handle: Mutex::new(None),
        }
    }

    fn handle(&self) -> MutexGuard<'_, Option<WorkerHandle>> {
        self.worker_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ResilienceRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<PermissionCache> {
        &self.cache
    }

    pub fn worker(&self) -> &Arc<InvalidationWorker> {
        &self.worker
    }

    /// Start the drain worker if enabled and not already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        if !self.config.invalidation.enabled {
            tracing::info!("Invalidation worker disabled");
            return false;
        }

        let mut handle = self.handle();
        if handle.as_ref().is_some_and(|running| !running.is_finished()) {
            return false;
        }
        *handle = Some(self.worker.clone().start());
        true
    }

    pub fn is_running(&self) -> bool {
        self.handle()
            .as_ref()
            .is_some_and(|running| !running.is_finished())
    }

    /// Forget all process-local state: L1, queued tasks, registry instances
    /// and cached resilience configuration. Distributed state is untouched.
    pub fn reset(&self) {
        self.cache.clear_local();
        self.cache.queue().drain(usize::MAX);
        self.registry.reset();
    }

    /// Stop the worker, waiting at most `app.shutdown_timeout_ms` for its
    /// final flush
    pub async fn shutdown(&self) {
        let Some(handle) = self.handle().take() else {
            return;
        };

        let timeout = std::time::Duration::from_millis(self.config.app.shutdown_timeout_ms);
        if tokio::time::timeout(timeout, handle.shutdown()).await.is_err() {
            tracing::warn!(
                timeout_ms = self.config.app.shutdown_timeout_ms,
                remaining = self.cache.queue().len(),
                "Invalidation worker did not stop in time"
            );
        } else {
            tracing::info!("Permission cache system stopped");
        }
    }
}

impl std::fmt::Debug for PermissionCacheSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionCacheSystem")
            .field("backend", &self.store.backend())
            .field("cache", &self.cache)
            .field("running", &self.is_running())
            .finish()
    }
}
