//! Resilience patterns backed by the distributed store
//!
//! Every primitive keeps its live state in the shared store, so all
//! processes using the same name see one breaker, one set of rate counters
//! and one concurrency budget. Each state change is one atomic store
//! operation.
//!
//! # Available Patterns
//!
//! - **Circuit Breaker**: stops calling a failing dependency until a
//!   recovery timeout has passed.
//! - **Rate Limiter**: token bucket, sliding window or fixed window, with
//!   optional per-user, per-server and per-IP limits.
//! - **Bulkhead**: caps concurrent calls.
//!
//! Instances are handed out by name from a [`ResilienceRegistry`] and
//! composed around a call with a [`ResilienceGuard`].
//!
//! # Example
//!
//! ```rust,no_run
//! use lighter_permission_cache::resilience::{ResilienceContext, ResilienceRegistry};
//! use lighter_permission_cache::store::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let context = ResilienceContext::with_defaults(Arc::new(MemoryStore::new()));
//! let registry = ResilienceRegistry::new(context);
//!
//! let guard = registry.guard().circuit_breaker("payment-api").build();
//! let result = guard
//!     .run(async { Ok::<_, std::io::Error>("paid") })
//!     .await;
//! # Ok(())
//! # }
//! ```

mod bulkhead;
mod circuit_breaker;
mod config_store;
mod guard;
mod rate_limiter;
mod registry;
pub mod state;

pub use bulkhead::{Bulkhead, BulkheadError, BulkheadPermit};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError};
pub use config_store::{ConfigStoreError, ResilienceConfigStore};
pub use guard::{GuardBuilder, GuardError, Guarded, ResilienceGuard, ResilienceLayer};
pub use rate_limiter::{RateDecision, RateDimension, RateDimensions, RateLimiter};
pub use registry::ResilienceRegistry;
pub use state::{BreakerDecision, CircuitState, RateAlgorithm, Transition};

use std::sync::Arc;

use crate::clock::{SharedClock, SystemClock};
use crate::collaborators::{SharedMonitor, null_monitor};
use crate::config::ResilienceConfig;
use crate::keys::KeySpace;
use crate::store::SharedStore;

/// Everything a primitive needs besides its name
#[derive(Debug, Clone)]
pub struct ResilienceContext {
    pub store: SharedStore,
    pub keys: KeySpace,
    pub clock: SharedClock,
    pub monitor: SharedMonitor,
    pub configs: Arc<ResilienceConfigStore>,
}

impl ResilienceContext {
    pub fn new(
        store: SharedStore,
        keys: KeySpace,
        clock: SharedClock,
        monitor: SharedMonitor,
        defaults: ResilienceConfig,
    ) -> Self {
        let configs = Arc::new(ResilienceConfigStore::new(
            store.clone(),
            keys.clone(),
            clock.clone(),
            defaults,
        ));
        Self {
            store,
            keys,
            clock,
            monitor,
            configs,
        }
    }

    /// Default configuration, wall clock, no monitoring, `pc` key prefix
    pub fn with_defaults(store: SharedStore) -> Self {
        Self::new(
            store,
            KeySpace::new("pc"),
            Arc::new(SystemClock),
            null_monitor(),
            ResilienceConfig::default(),
        )
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}
