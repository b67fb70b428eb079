//! Distributed permission caching for multi-tenant backends
//!
//! A two-level permission cache (in-process L1, distributed L2) with
//! delayed batched invalidation, store-backed resilience primitives and a
//! distributed lock. [`PermissionCacheSystem`] wires everything from one
//! [`config::AppConfig`].

// Re-export all public modules
pub mod cache;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod invalidation;
pub mod keys;
pub mod lock;
pub mod metrics;
pub mod resilience;
pub mod store;
pub mod system;
pub mod telemetry;

// Testing utilities (always available for integration tests)
pub mod testing;

// Re-export commonly used types for convenience
pub use cache::{LocalCache, PermissionCache, PermissionSet};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use collaborators::{Monitor, NullMonitor, PermissionSource, SharedMonitor};
pub use invalidation::{InvalidationLevel, InvalidationQueue, InvalidationWorker};
pub use keys::{CacheKey, KeySpace, Scope};
pub use lock::{DistributedLock, LockOptions};
pub use crate::metrics::MetricsMonitor;
pub use resilience::{ResilienceGuard, ResilienceRegistry};
pub use store::{DistributedStore, MemoryStore, RedisStore, SharedStore, StoreError};
pub use system::PermissionCacheSystem;
