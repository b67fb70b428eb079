//! Named resilience instances
//!
//! One shared instance per `(kind, name)` in this process; the distributed
//! state behind each instance is shared with every other process.

use dashmap::DashMap;
use std::sync::Arc;

use super::guard::GuardBuilder;
use super::{Bulkhead, CircuitBreaker, RateLimiter, ResilienceConfigStore, ResilienceContext};
use crate::store::StoreResult;

/// Registry of circuit breakers, rate limiters and bulkheads
#[derive(Debug)]
pub struct ResilienceRegistry {
    context: ResilienceContext,
    circuit_breakers: DashMap<String, Arc<CircuitBreaker>>,
    rate_limiters: DashMap<String, Arc<RateLimiter>>,
    bulkheads: DashMap<String, Arc<Bulkhead>>,
}

impl ResilienceRegistry {
    pub fn new(context: ResilienceContext) -> Self {
        Self {
            context,
            circuit_breakers: DashMap::new(),
            rate_limiters: DashMap::new(),
            bulkheads: DashMap::new(),
        }
    }

    pub fn context(&self) -> &ResilienceContext {
        &self.context
    }

    pub fn configs(&self) -> &Arc<ResilienceConfigStore> {
        &self.context.configs
    }

    pub fn circuit_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.circuit_breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(circuit_breaker = %name, "Registered circuit breaker");
                Arc::new(CircuitBreaker::new(name, self.context.clone()))
            })
            .clone()
    }

    pub fn rate_limiter(&self, name: &str) -> Arc<RateLimiter> {
        self.rate_limiters
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(rate_limiter = %name, "Registered rate limiter");
                Arc::new(RateLimiter::new(name, self.context.clone()))
            })
            .clone()
    }

    pub fn bulkhead(&self, name: &str) -> Arc<Bulkhead> {
        self.bulkheads
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(bulkhead = %name, "Registered bulkhead");
                Arc::new(Bulkhead::new(name, self.context.clone()))
            })
            .clone()
    }

    /// Start composing a guard from instances of this registry
    pub fn guard(&self) -> GuardBuilder<'_> {
        GuardBuilder::new(self)
    }

    /// Names registered in this process, sorted, per kind
    pub fn names(&self) -> (Vec<String>, Vec<String>, Vec<String>) {
        fn sorted<V>(map: &DashMap<String, V>) -> Vec<String> {
            let mut names: Vec<String> = map.iter().map(|e| e.key().clone()).collect();
            names.sort();
            names
        }
        (
            sorted(&self.circuit_breakers),
            sorted(&self.rate_limiters),
            sorted(&self.bulkheads),
        )
    }

    /// Forget every local instance and cached configuration.
    ///
    /// Distributed state is untouched; see [`Self::reset_state`].
    pub fn reset(&self) {
        self.circuit_breakers.clear();
        self.rate_limiters.clear();
        self.bulkheads.clear();
        self.context.configs.clear_local();
    }

    /// Reset the distributed state of every primitive called `name`
    #[tracing::instrument(skip(self))]
    pub async fn reset_state(&self, name: &str) -> StoreResult<()> {
        self.circuit_breaker(name).reset().await?;
        self.rate_limiter(name).reset().await?;
        self.bulkhead(name).reset().await
    }
}
