//! Distributed rate limiter
//!
//! One named limiter checks a combined ceiling plus optional per-user,
//! per-server and per-IP limits. All dimension keys share the limiter's hash
//! tag and are checked and consumed in one atomic store operation: any denial
//! denies the call and consumes nothing.
//!
//! When the store is unreachable the limiter falls back to per-process
//! governor limiters with the same quotas. There is one keyed limiter per
//! dimension and quota. Idle identifiers are pruned while the outage lasts,
//! and the whole fallback is dropped on the first answer from the store.

use dashmap::DashMap;
use governor::{
    Quota,
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::ResilienceContext;
use super::state::{RateAlgorithm, RateRule};
use crate::config::{LimitSpec, RateLimiterConfig};
use crate::store::StoreResult;

type LocalLimiter = governor::RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Local checks between two prunes of idle fallback identifiers
const FALLBACK_PRUNE_EVERY: u64 = 1024;

/// Which limit a rule enforces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateDimension {
    /// Shared ceiling across every caller
    Combined,
    User,
    Server,
    Ip,
}

impl RateDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateDimension::Combined => "all",
            RateDimension::User => "user",
            RateDimension::Server => "server",
            RateDimension::Ip => "ip",
        }
    }
}

impl fmt::Display for RateDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifiers carried by one call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateDimensions {
    pub user: Option<String>,
    pub server: Option<String>,
    pub ip: Option<String>,
}

impl RateDimensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }
}

/// Answer for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Smallest remaining allowance across the checked dimensions.
    /// Zero when the answer came from the local fallback.
    pub remaining: u64,
    pub retry_after: Duration,
    /// Dimension that denied the call
    pub limited_by: Option<RateDimension>,
    /// The store was unreachable and local limiters answered
    pub degraded: bool,
}

/// Named, distributed rate limiter
pub struct RateLimiter {
    name: String,
    context: ResilienceContext,
    fallback: DashMap<String, Arc<LocalLimiter>>,
    fallback_active: AtomicBool,
    local_checks: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    store_errors: AtomicU64,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, context: ResilienceContext) -> Self {
        Self {
            name: name.into(),
            context,
            fallback: DashMap::new(),
            fallback_active: AtomicBool::new(false),
            local_checks: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allowed_calls(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    pub fn denied_calls(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    pub fn store_errors(&self) -> u64 {
        self.store_errors.load(Ordering::Relaxed)
    }

    /// Identifiers currently tracked by the local fallback
    pub fn fallback_entries(&self) -> usize {
        self.fallback.iter().map(|limiter| limiter.len()).sum()
    }

    /// Rules for this call, combined ceiling first
    fn rules(
        &self,
        config: &RateLimiterConfig,
        dimensions: &RateDimensions,
    ) -> Vec<(RateDimension, RateRule)> {
        let keys = &self.context.keys;
        let mut rules = vec![(
            RateDimension::Combined,
            rule(
                keys.rate(&self.name, RateDimension::Combined.as_str(), None),
                &config.combined(),
            ),
        )];

        let optional = [
            (RateDimension::User, &config.per_user, &dimensions.user),
            (RateDimension::Server, &config.per_server, &dimensions.server),
            (RateDimension::Ip, &config.per_ip, &dimensions.ip),
        ];
        for (dimension, spec, value) in optional {
            if let (Some(spec), Some(value)) = (spec, value) {
                let key = keys.rate(&self.name, dimension.as_str(), Some(value));
                rules.push((dimension, rule(key, spec)));
            }
        }
        rules
    }

    /// Check the combined limit only
    pub async fn check(&self) -> RateDecision {
        self.check_dimensions(&RateDimensions::default()).await
    }

    /// Check every applicable dimension; most restrictive wins
    #[tracing::instrument(skip(self, dimensions), fields(rate_limiter = %self.name))]
    pub async fn check_dimensions(&self, dimensions: &RateDimensions) -> RateDecision {
        let config = self.context.configs.rate_limiter(&self.name).await;
        let rules = self.rules(&config, dimensions);
        let plain: Vec<RateRule> = rules.iter().map(|(_, rule)| rule.clone()).collect();

        let decision = match self
            .context
            .store
            .rate_limit(config.algorithm, &plain, self.context.now_millis())
            .await
        {
            Ok(verdict) => {
                if self.fallback_active.swap(false, Ordering::AcqRel) {
                    self.fallback.clear();
                    tracing::info!("Rate limiter store recovered, local limiters dropped");
                }
                RateDecision {
                    allowed: verdict.allowed,
                    remaining: verdict.remaining,
                    retry_after: Duration::from_millis(verdict.retry_after_ms),
                    limited_by: verdict
                        .limited_by
                        .and_then(|index| rules.get(index).map(|(dimension, _)| *dimension)),
                    degraded: false,
                }
            }
            Err(e) => {
                self.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "Rate limiter store unavailable, using local limiter");
                self.check_locally(config.algorithm, &rules)
            }
        };

        if decision.allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            let dimension = decision.limited_by.unwrap_or(RateDimension::Combined);
            tracing::debug!(
                dimension = dimension.as_str(),
                retry_after = ?decision.retry_after,
                "Rate limit exceeded"
            );
            self.context.monitor.record_event(
                "rate_limit_exceeded",
                &[
                    ("limiter", self.name.clone()),
                    ("dimension", dimension.as_str().to_string()),
                    ("algorithm", config.algorithm.as_str().to_string()),
                ],
            );
        }

        decision
    }

    /// Per-process approximation used while the store is down.
    ///
    /// Dimensions are checked in order, so earlier dimensions may have
    /// consumed a cell when a later one denies.
    fn check_locally(
        &self,
        algorithm: RateAlgorithm,
        rules: &[(RateDimension, RateRule)],
    ) -> RateDecision {
        self.fallback_active.store(true, Ordering::Release);
        if self.local_checks.fetch_add(1, Ordering::Relaxed) % FALLBACK_PRUNE_EVERY
            == FALLBACK_PRUNE_EVERY - 1
        {
            for limiter in self.fallback.iter() {
                limiter.retain_recent();
                limiter.shrink_to_fit();
            }
        }

        for (dimension, rule) in rules {
            let limiter = self
                .fallback
                .entry(format!(
                    "{}|{}|{}|{}|{}",
                    dimension, algorithm, rule.limit, rule.window_ms, rule.burst
                ))
                .or_insert_with(|| Arc::new(local_limiter(rule)))
                .clone();

            if let Err(not_until) = limiter.check_key(&rule.key) {
                return RateDecision {
                    allowed: false,
                    remaining: 0,
                    retry_after: not_until.wait_time_from(DefaultClock::default().now()),
                    limited_by: Some(*dimension),
                    degraded: true,
                };
            }
        }

        RateDecision {
            allowed: true,
            remaining: 0,
            retry_after: Duration::ZERO,
            limited_by: None,
            degraded: true,
        }
    }

    /// Delete the stored counters of the combined dimension and forget local
    /// fallback state. Per-identifier counters expire on their own.
    pub async fn reset(&self) -> StoreResult<()> {
        let combined = self
            .context
            .keys
            .rate(&self.name, RateDimension::Combined.as_str(), None);
        let config = self.context.configs.rate_limiter(&self.name).await;
        let mut keys = vec![combined.clone()];
        if config.algorithm != RateAlgorithm::TokenBucket {
            let index = self.context.now_millis() / config.window_ms.max(1);
            keys.push(format!("{}:{}", combined, index));
            keys.push(format!("{}:{}", combined, index.saturating_sub(1)));
        }

        self.fallback.clear();
        self.context.store.delete(&keys).await?;
        tracing::info!(rate_limiter = %self.name, "Rate limiter reset");
        Ok(())
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("allowed", &self.allowed_calls())
            .field("denied", &self.denied_calls())
            .field("store_errors", &self.store_errors())
            .finish()
    }
}

fn rule(key: String, spec: &LimitSpec) -> RateRule {
    RateRule {
        key,
        limit: spec.limit,
        window_ms: spec.window_ms,
        burst: spec.effective_burst(),
    }
}

fn local_limiter(rule: &RateRule) -> LocalLimiter {
    let period = Duration::from_millis(rule.window_ms.max(1)) / rule.limit.clamp(1, u32::MAX as u64) as u32;
    let burst = NonZeroU32::new(rule.burst.min(u32::MAX as u64) as u32).unwrap_or(NonZeroU32::MIN);
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX))
        .allow_burst(burst);
    governor::RateLimiter::keyed(quota)
}
