//! Guard composition
//!
//! A [`ResilienceGuard`] wraps one call in an optional circuit breaker, rate
//! limiter and bulkhead. Checks run in that order; the call outcome is then
//! reported to the breaker. [`ResilienceLayer`] applies the same guard to a
//! `tower` service.

use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use super::registry::ResilienceRegistry;
use super::{Bulkhead, CircuitBreaker, RateDimension, RateDimensions, RateLimiter};

/// Why a guarded call did not produce a value
#[derive(Debug, thiserror::Error)]
pub enum GuardError<E> {
    #[error("Circuit breaker is open for {name}")]
    CircuitOpen { name: String },

    #[error("Rate limit exceeded for {name} ({dimension}), retry after {retry_after:?}")]
    RateLimited {
        name: String,
        dimension: RateDimension,
        retry_after: Duration,
    },

    #[error("Bulkhead {name} is full")]
    BulkheadFull { name: String },

    #[error("Operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> GuardError<E> {
    /// The call was turned away before it ran
    pub fn is_rejected(&self) -> bool {
        !matches!(self, GuardError::Inner(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            GuardError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Breaker, limiter and bulkhead applied around one call
#[derive(Debug, Clone, Default)]
pub struct ResilienceGuard {
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    dimensions: RateDimensions,
    bulkhead: Option<Arc<Bulkhead>>,
}

impl ResilienceGuard {
    /// A guard that lets everything through
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_bulkhead(mut self, bulkhead: Arc<Bulkhead>) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    /// Same guard, rate limited on the given identifiers
    pub fn with_dimensions(&self, dimensions: RateDimensions) -> Self {
        Self {
            dimensions,
            ..self.clone()
        }
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.circuit_breaker.as_ref()
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    pub fn bulkhead(&self) -> Option<&Arc<Bulkhead>> {
        self.bulkhead.as_ref()
    }

    /// Run an already created future under the guard
    pub async fn run<F, T, E>(&self, fut: F) -> Result<T, GuardError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.call(|| fut).await
    }

    /// Create and run the call only once every check has passed
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(breaker) = &self.circuit_breaker {
            if !breaker.check().await.can_execute {
                return Err(GuardError::CircuitOpen {
                    name: breaker.name().to_string(),
                });
            }
        }

        if let Some(limiter) = &self.rate_limiter {
            let decision = limiter.check_dimensions(&self.dimensions).await;
            if !decision.allowed {
                return Err(GuardError::RateLimited {
                    name: limiter.name().to_string(),
                    dimension: decision.limited_by.unwrap_or(RateDimension::Combined),
                    retry_after: decision.retry_after,
                });
            }
        }

        let permit = match &self.bulkhead {
            Some(bulkhead) => match bulkhead.try_acquire().await {
                Some(permit) => Some(permit),
                None => {
                    return Err(GuardError::BulkheadFull {
                        name: bulkhead.name().to_string(),
                    });
                }
            },
            None => None,
        };

        let result = f().await;

        if let Some(permit) = permit {
            permit.release().await;
        }

        if let Some(breaker) = &self.circuit_breaker {
            if result.is_ok() {
                breaker.record_success().await;
            } else {
                breaker.record_failure().await;
            }
        }

        result.map_err(GuardError::Inner)
    }
}

/// Builds a [`ResilienceGuard`] from registry names.
///
/// Names are resolved here, once; the built guard holds the instances.
#[derive(Debug)]
pub struct GuardBuilder<'a> {
    registry: &'a ResilienceRegistry,
    guard: ResilienceGuard,
}

impl<'a> GuardBuilder<'a> {
    pub(crate) fn new(registry: &'a ResilienceRegistry) -> Self {
        Self {
            registry,
            guard: ResilienceGuard::new(),
        }
    }

    pub fn circuit_breaker(mut self, name: &str) -> Self {
        self.guard.circuit_breaker = Some(self.registry.circuit_breaker(name));
        self
    }

    pub fn rate_limiter(mut self, name: &str) -> Self {
        self.guard.rate_limiter = Some(self.registry.rate_limiter(name));
        self
    }

    pub fn dimensions(mut self, dimensions: RateDimensions) -> Self {
        self.guard.dimensions = dimensions;
        self
    }

    pub fn bulkhead(mut self, name: &str) -> Self {
        self.guard.bulkhead = Some(self.registry.bulkhead(name));
        self
    }

    pub fn build(self) -> ResilienceGuard {
        self.guard
    }
}

/// `tower` layer applying a [`ResilienceGuard`] to every request
#[derive(Debug, Clone)]
pub struct ResilienceLayer {
    guard: ResilienceGuard,
}

impl ResilienceLayer {
    pub fn new(guard: ResilienceGuard) -> Self {
        Self { guard }
    }
}

impl<S> tower::Layer<S> for ResilienceLayer {
    type Service = Guarded<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Guarded {
            inner,
            guard: self.guard.clone(),
        }
    }
}

/// Service produced by [`ResilienceLayer`]
#[derive(Debug, Clone)]
pub struct Guarded<S> {
    inner: S,
    guard: ResilienceGuard,
}

impl<S, Req> tower::Service<Req> for Guarded<S>
where
    S: tower::Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = GuardError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // The ready service goes into the future; a fresh clone stays behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let guard = self.guard.clone();

        Box::pin(async move { guard.call(move || inner.call(req)).await })
    }
}
