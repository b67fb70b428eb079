//! Circuit Breaker Pattern Implementation
//!
//! The breaker state lives in the distributed store, so every process using
//! the same name trips and recovers together. Each `check`, success and
//! failure is one atomic transition (see [`crate::resilience::state::breaker_step`]).
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐
//! │ Closed  │ ◄──────────────────┐
//! │ (Normal)│                    │
//! └────┬────┘                    │
//!      │ failure_threshold       │ one success
//!      │ consecutive failures    │
//!      ▼                         │
//! ┌─────────┐ recovery_timeout ┌─┴─────────┐
//! │  Open   │─────────────────►│ HalfOpen  │
//! │(Failing)│                  │  (Trial)  │
//! └─────────┘◄─────────────────└───────────┘
//!                one failure
//! ```
//!
//! If the store cannot be reached the breaker fails open: calls proceed and
//! the state reads as Closed.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use super::ResilienceContext;
use super::state::{BreakerDecision, BreakerRecord, CallOutcome, CircuitState};
use crate::store::StoreResult;

/// Process-local call statistics
#[derive(Debug, Default)]
pub struct CircuitBreakerStats {
    /// Total number of calls executed
    total_calls: AtomicU64,
    /// Total number of failed calls
    total_failures: AtomicU64,
    /// Calls rejected while the circuit was open
    rejected_calls: AtomicU64,
    /// Transitions that could not reach the store
    store_errors: AtomicU64,
}

impl CircuitBreakerStats {
    fn record_success(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rejection(&self) {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Circuit breaker error
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, rejecting requests
    #[error("Circuit breaker is open for {name}")]
    Open { name: String },
    /// The underlying operation failed
    #[error("Operation failed: {0}")]
    Inner(#[source] E),
}

/// Named, distributed circuit breaker
///
/// Thresholds are read from the config store on every transition, so a
/// configuration change applies within the config cache TTL without
/// recreating the breaker.
pub struct CircuitBreaker {
    /// Name for logging, metrics and the store key
    name: String,
    state_key: String,
    context: ResilienceContext,
    stats: CircuitBreakerStats,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, context: ResilienceContext) -> Self {
        let name = name.into();
        Self {
            state_key: context.keys.breaker_state(&name),
            name,
            context,
            stats: CircuitBreakerStats::default(),
        }
    }

    /// Get the circuit breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store key holding the shared state
    pub fn state_key(&self) -> &str {
        &self.state_key
    }

    /// Get total number of calls
    pub fn total_calls(&self) -> u64 {
        self.stats.total_calls.load(Ordering::Relaxed)
    }

    /// Get total number of failures
    pub fn total_failures(&self) -> u64 {
        self.stats.total_failures.load(Ordering::Relaxed)
    }

    pub fn rejected_calls(&self) -> u64 {
        self.stats.rejected_calls.load(Ordering::Relaxed)
    }

    pub fn store_errors(&self) -> u64 {
        self.stats.store_errors.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 to 1.0)
    pub fn failure_rate(&self) -> f64 {
        let total = self.total_calls();
        if total == 0 {
            return 0.0;
        }
        self.total_failures() as f64 / total as f64
    }

    /// Ask whether a call may proceed; may move OPEN to HALF_OPEN
    pub async fn check(&self) -> BreakerDecision {
        self.transition(CallOutcome::Check).await
    }

    pub async fn record_success(&self) -> BreakerDecision {
        self.stats.record_success();
        self.transition(CallOutcome::Success).await
    }

    pub async fn record_failure(&self) -> BreakerDecision {
        self.stats.record_failure();
        self.transition(CallOutcome::Failure).await
    }

    #[tracing::instrument(skip(self, outcome), fields(circuit_breaker = %self.name, outcome = outcome.as_str()))]
    async fn transition(&self, outcome: CallOutcome) -> BreakerDecision {
        let config = self.context.configs.circuit_breaker(&self.name).await;
        let now = self.context.now_millis();

        let decision = match self
            .context
            .store
            .breaker_transition(&self.state_key, outcome, &config.policy(), now)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                self.stats.record_store_error();
                tracing::warn!(error = %e, "Circuit breaker store unavailable, failing open");
                return BreakerDecision::fail_open();
            }
        };

        if let Some(transition) = decision.transition {
            match decision.state {
                CircuitState::Open => tracing::warn!(
                    state = transition.as_str(),
                    failure_count = decision.failure_count,
                    failure_threshold = config.failure_threshold,
                    "Circuit breaker opened"
                ),
                _ => tracing::info!(
                    state = transition.as_str(),
                    "Circuit breaker transition"
                ),
            }
            self.context.monitor.record_event(
                "circuit_breaker_transition",
                &[
                    ("breaker", self.name.clone()),
                    ("transition", transition.as_str().to_string()),
                    ("state", decision.state.as_str().to_string()),
                    ("failure_count", decision.failure_count.to_string()),
                ],
            );
        }

        decision
    }

    /// Execute an operation protected by the circuit breaker
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use lighter_permission_cache::resilience::{CircuitBreaker, ResilienceContext};
    /// use lighter_permission_cache::store::MemoryStore;
    /// use std::sync::Arc;
    ///
    /// # async fn example() {
    /// let context = ResilienceContext::with_defaults(Arc::new(MemoryStore::new()));
    /// let cb = CircuitBreaker::new("external-api", context);
    ///
    /// match cb.call(async { Ok::<_, std::io::Error>(42) }).await {
    ///     Ok(value) => println!("Got: {}", value),
    ///     Err(e) => println!("Error: {}", e),
    /// }
    /// # }
    /// ```
    pub async fn call<F, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.check().await.can_execute {
            self.stats.record_rejection();
            return Err(CircuitBreakerError::Open {
                name: self.name.clone(),
            });
        }

        match f.await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(err) => {
                self.record_failure().await;
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Shared state as stored
    pub async fn snapshot(&self) -> StoreResult<BreakerRecord> {
        self.context.store.breaker_snapshot(&self.state_key).await
    }

    /// Current state; Closed when the store cannot be read
    pub async fn state(&self) -> CircuitState {
        self.snapshot()
            .await
            .map(|record| record.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Reset the shared state to Closed
    ///
    /// This is useful for testing or administrative purposes.
    pub async fn reset(&self) -> StoreResult<()> {
        self.context
            .store
            .delete(std::slice::from_ref(&self.state_key))
            .await?;
        tracing::info!(
            circuit_breaker = %self.name,
            "Circuit breaker manually reset to Closed"
        );
        Ok(())
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state_key", &self.state_key)
            .field("stats", &self.stats)
            .finish()
    }
}
