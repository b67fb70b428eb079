//! Hot-reloadable configuration of named resilience instances
//!
//! Configurations live in the distributed store as tagged JSON, one key per
//! `(kind, name)`. Every process keeps a short-TTL copy so the hot path does
//! not pay a round trip per call. When the store cannot be read the last
//! known good copy is used, then the configured default.

use dashmap::DashMap;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::config::{
    BulkheadConfig, CircuitBreakerConfig, ConfigError, PrimitiveConfig, PrimitiveKind,
    RateLimiterConfig, ResilienceConfig, Validate,
};
use crate::keys::KeySpace;
use crate::lock::{DistributedLock, LockError, LockOptions};
use crate::store::{SharedStore, StoreError};

/// Errors writing configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigStoreError {
    #[error(transparent)]
    Invalid(#[from] ConfigError),

    #[error(transparent)]
    Locked(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode configuration: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
struct CachedConfig {
    config: PrimitiveConfig,
    fetched_at_ms: u64,
}

/// Read-through configuration store for resilience instances
#[derive(Debug)]
pub struct ResilienceConfigStore {
    store: SharedStore,
    keys: KeySpace,
    clock: SharedClock,
    defaults: ResilienceConfig,
    lock_options: LockOptions,
    cached: DashMap<(PrimitiveKind, String), CachedConfig>,
}

impl ResilienceConfigStore {
    pub fn new(
        store: SharedStore,
        keys: KeySpace,
        clock: SharedClock,
        defaults: ResilienceConfig,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            defaults,
            lock_options: LockOptions::default(),
            cached: DashMap::new(),
        }
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock_options = options;
        self
    }

    pub fn defaults(&self) -> &ResilienceConfig {
        &self.defaults
    }

    fn ttl_ms(&self) -> u64 {
        self.defaults.config_cache_ttl_ms
    }

    /// Current configuration of `name`, never failing
    #[tracing::instrument(skip(self, kind), fields(kind = %kind))]
    pub async fn get(&self, kind: PrimitiveKind, name: &str) -> PrimitiveConfig {
        let now = self.clock.now_millis();
        let cache_key = (kind, name.to_string());

        if let Some(cached) = self.cached.get(&cache_key) {
            if now.saturating_sub(cached.fetched_at_ms) < self.ttl_ms() {
                return cached.config.clone();
            }
        }

        let config = match self.store.get(&self.keys.config(kind.as_str(), name)).await {
            Ok(Some(bytes)) => match decode(kind, &bytes) {
                Ok(config) => config,
                Err(reason) => {
                    tracing::warn!(reason = %reason, "Stored configuration rejected, using fallback");
                    self.fallback(&cache_key)
                }
            },
            Ok(None) => self.defaults.default_for(kind, name),
            Err(e) => {
                tracing::warn!(error = %e, "Configuration read failed, using fallback");
                self.fallback(&cache_key)
            }
        };

        self.cached.insert(
            cache_key,
            CachedConfig {
                config: config.clone(),
                fetched_at_ms: now,
            },
        );
        config
    }

    /// Last known good, else the default
    fn fallback(&self, cache_key: &(PrimitiveKind, String)) -> PrimitiveConfig {
        self.cached
            .get(cache_key)
            .map(|cached| cached.config.clone())
            .unwrap_or_else(|| self.defaults.default_for(cache_key.0, &cache_key.1))
    }

    pub async fn circuit_breaker(&self, name: &str) -> CircuitBreakerConfig {
        match self.get(PrimitiveKind::CircuitBreaker, name).await {
            PrimitiveConfig::CircuitBreaker(config) => config,
            _ => self.defaults.circuit_breaker,
        }
    }

    pub async fn rate_limiter(&self, name: &str) -> RateLimiterConfig {
        match self.get(PrimitiveKind::RateLimiter, name).await {
            PrimitiveConfig::RateLimiter(config) => config,
            _ => self.defaults.rate_limiter.clone(),
        }
    }

    pub async fn bulkhead(&self, name: &str) -> BulkheadConfig {
        match self.get(PrimitiveKind::Bulkhead, name).await {
            PrimitiveConfig::Bulkhead(config) => config,
            _ => self.defaults.bulkhead,
        }
    }

    /// Validate and store a configuration under the config lock
    #[tracing::instrument(skip(self, config))]
    pub async fn set(
        &self,
        name: &str,
        config: impl Into<PrimitiveConfig>,
    ) -> Result<(), ConfigStoreError> {
        let config = config.into();
        config.validate()?;

        let kind = config.kind();
        let key = self.keys.config(kind.as_str(), name);
        let payload = serde_json::to_vec(&config)?;
        let lock = DistributedLock::new(
            self.store.clone(),
            self.keys.resource_lock(&format!("cfg:{}:{}", kind, name)),
            self.lock_options,
        );

        lock.with_lock(async {
            self.store.set(&key, &payload, None).await?;
            self.store.index_add(&self.keys.config_index(), &key).await
        })
        .await??;

        self.cached.insert(
            (kind, name.to_string()),
            CachedConfig {
                config,
                fetched_at_ms: self.clock.now_millis(),
            },
        );
        tracing::info!(kind = %kind, "Resilience configuration updated");
        Ok(())
    }

    pub async fn set_circuit_breaker(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<(), ConfigStoreError> {
        self.set(name, config).await
    }

    pub async fn set_rate_limiter(
        &self,
        name: &str,
        config: RateLimiterConfig,
    ) -> Result<(), ConfigStoreError> {
        self.set(name, config).await
    }

    pub async fn set_bulkhead(
        &self,
        name: &str,
        config: BulkheadConfig,
    ) -> Result<(), ConfigStoreError> {
        self.set(name, config).await
    }

    /// Delete every stored configuration and forget local copies.
    /// Returns how many stored configurations existed.
    pub async fn clear_all(&self) -> Result<u64, ConfigStoreError> {
        let index = self.keys.config_index();
        let members = self.store.index_members(&index).await?;
        let deleted = self.store.delete(&members).await?;
        self.store.delete(&[index]).await?;
        self.cached.clear();

        tracing::info!(deleted, "Resilience configuration cleared");
        Ok(deleted)
    }

    /// Drop the local copy so the next read goes to the store
    pub fn invalidate_local(&self, kind: PrimitiveKind, name: &str) {
        self.cached.remove(&(kind, name.to_string()));
    }

    pub fn clear_local(&self) {
        self.cached.clear();
    }

    /// How long local copies are trusted
    pub fn cache_ttl(&self) -> Duration {
        self.defaults.config_cache_ttl()
    }
}

fn decode(kind: PrimitiveKind, bytes: &[u8]) -> Result<PrimitiveConfig, String> {
    let config: PrimitiveConfig = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    if config.kind() != kind {
        return Err(format!("expected {} configuration, found {}", kind, config.kind()));
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}
