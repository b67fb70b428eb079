//! Resilience state records and their transition rules
//!
//! These are the pure forms of the atomic operations the distributed store
//! runs. The in-memory backend calls them under its mutex; the Redis backend
//! runs Lua scripts that implement the same rules (see `store::scripts`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, allowing all requests through
    Closed,
    /// Trial state after the recovery timeout
    HalfOpen,
    /// Failing state, rejecting all requests until the recovery timeout expires
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::HalfOpen => "HALF_OPEN",
            CircuitState::Open => "OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CLOSED" => Ok(CircuitState::Closed),
            "HALF_OPEN" => Ok(CircuitState::HalfOpen),
            "OPEN" => Ok(CircuitState::Open),
            other => Err(format!("unknown circuit state {:?}", other)),
        }
    }
}

/// What a caller reports to the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Ask whether a call may proceed
    Check,
    Success,
    Failure,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Check => "check",
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
        }
    }
}

/// State change produced by one breaker operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    ClosedToOpen,
    OpenToHalfOpen,
    HalfOpenToClosed,
    HalfOpenToOpen,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::ClosedToOpen => "closed_to_open",
            Transition::OpenToHalfOpen => "open_to_half_open",
            Transition::HalfOpenToClosed => "half_open_to_closed",
            Transition::HalfOpenToOpen => "half_open_to_open",
        }
    }

    /// Parse the event string returned by the breaker script; empty means none
    pub fn parse_event(event: &str) -> Result<Option<Self>, String> {
        match event {
            "" => Ok(None),
            "closed_to_open" => Ok(Some(Transition::ClosedToOpen)),
            "open_to_half_open" => Ok(Some(Transition::OpenToHalfOpen)),
            "half_open_to_closed" => Ok(Some(Transition::HalfOpenToClosed)),
            "half_open_to_open" => Ok(Some(Transition::HalfOpenToOpen)),
            other => Err(format!("unknown breaker event {:?}", other)),
        }
    }

    pub fn to_state(&self) -> CircuitState {
        match self {
            Transition::ClosedToOpen | Transition::HalfOpenToOpen => CircuitState::Open,
            Transition::OpenToHalfOpen => CircuitState::HalfOpen,
            Transition::HalfOpenToClosed => CircuitState::Closed,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds applied by one breaker operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

/// Stored breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerRecord {
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at_ms: u64,
}

impl Default for BreakerRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at_ms: 0,
        }
    }
}

/// Answer of one breaker operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerDecision {
    pub can_execute: bool,
    pub state: CircuitState,
    pub transition: Option<Transition>,
    pub failure_count: u32,
}

impl BreakerDecision {
    /// Decision reported when the store cannot be reached
    pub fn fail_open() -> Self {
        Self {
            can_execute: true,
            state: CircuitState::Closed,
            transition: None,
            failure_count: 0,
        }
    }
}

/// Apply one outcome to a breaker record.
///
/// HALF_OPEN is resolved by a single call: one success closes the circuit
/// and clears the failure count, one failure reopens it and restarts the
/// recovery timer.
pub fn breaker_step(
    record: &mut BreakerRecord,
    outcome: CallOutcome,
    policy: &BreakerPolicy,
    now_ms: u64,
) -> BreakerDecision {
    let mut transition = None;

    match (outcome, record.state) {
        (CallOutcome::Check, CircuitState::Open) => {
            if now_ms.saturating_sub(record.opened_at_ms) >= policy.recovery_timeout_ms {
                record.state = CircuitState::HalfOpen;
                transition = Some(Transition::OpenToHalfOpen);
            }
        }
        (CallOutcome::Success, CircuitState::HalfOpen) => {
            record.state = CircuitState::Closed;
            record.failure_count = 0;
            transition = Some(Transition::HalfOpenToClosed);
        }
        (CallOutcome::Success, CircuitState::Closed) => {
            record.failure_count = 0;
        }
        (CallOutcome::Failure, CircuitState::Closed) => {
            record.failure_count = record.failure_count.saturating_add(1);
            if record.failure_count >= policy.failure_threshold {
                record.state = CircuitState::Open;
                record.opened_at_ms = now_ms;
                transition = Some(Transition::ClosedToOpen);
            }
        }
        (CallOutcome::Failure, CircuitState::HalfOpen) => {
            record.state = CircuitState::Open;
            record.opened_at_ms = now_ms;
            record.failure_count = record.failure_count.saturating_add(1);
            transition = Some(Transition::HalfOpenToOpen);
        }
        // Late outcomes of calls admitted before the circuit opened
        (CallOutcome::Success | CallOutcome::Failure, CircuitState::Open) => {}
        (CallOutcome::Check, _) => {}
    }

    BreakerDecision {
        can_execute: record.state != CircuitState::Open,
        state: record.state,
        transition,
        failure_count: record.failure_count,
    }
}

/// Rate limiting algorithm of a named limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateAlgorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

impl RateAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateAlgorithm::TokenBucket => "token_bucket",
            RateAlgorithm::SlidingWindow => "sliding_window",
            RateAlgorithm::FixedWindow => "fixed_window",
        }
    }
}

impl fmt::Display for RateAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dimension checked by a rate limit operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateRule {
    /// Store key holding this dimension's counters
    pub key: String,
    /// Requests (or tokens) per window
    pub limit: u64,
    pub window_ms: u64,
    /// Token bucket capacity; ignored by the window algorithms
    pub burst: u64,
}

impl RateRule {
    /// Counter keys of the window holding `now_ms` and the one before it
    pub fn window_keys(&self, now_ms: u64) -> (String, String) {
        let index = window_index(now_ms, self.window_ms);
        (
            format!("{}:{}", self.key, index),
            format!("{}:{}", self.key, index as i64 - 1),
        )
    }
}

/// Answer of one rate limit operation over all its dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateVerdict {
    pub allowed: bool,
    /// Index of the first rule that denied the call
    pub limited_by: Option<usize>,
    /// Smallest remaining allowance across dimensions after this call
    pub remaining: u64,
    pub retry_after_ms: u64,
}

/// Token bucket state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketRecord {
    pub tokens: f64,
    pub refilled_at_ms: u64,
}

impl BucketRecord {
    pub fn full(rule: &RateRule, now_ms: u64) -> Self {
        Self {
            tokens: rule.burst as f64,
            refilled_at_ms: now_ms,
        }
    }

    /// Refill continuously at `limit / window` tokens per millisecond
    pub fn refill(&mut self, rule: &RateRule, now_ms: u64) {
        if now_ms > self.refilled_at_ms {
            let elapsed = (now_ms - self.refilled_at_ms) as f64;
            let added = elapsed * rule.limit as f64 / rule.window_ms as f64;
            self.tokens = (self.tokens + added).min(rule.burst as f64);
            self.refilled_at_ms = now_ms;
        }
    }

    /// Milliseconds until one whole token is available
    pub fn wait_for_token_ms(&self, rule: &RateRule) -> u64 {
        if self.tokens >= 1.0 {
            return 0;
        }
        ((1.0 - self.tokens) * rule.window_ms as f64 / rule.limit as f64).ceil() as u64
    }
}

/// Index of the fixed window containing `now_ms`
pub fn window_index(now_ms: u64, window_ms: u64) -> u64 {
    now_ms / window_ms.max(1)
}

/// Approximate sliding-window count from the current and previous windows
pub fn sliding_count(previous: u64, current: u64, now_ms: u64, window_ms: u64) -> f64 {
    let window_ms = window_ms.max(1);
    let elapsed = now_ms - window_index(now_ms, window_ms) * window_ms;
    previous as f64 * (window_ms - elapsed) as f64 / window_ms as f64 + current as f64
}

/// Bulkhead answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadAdmission {
    pub admitted: bool,
    pub active_calls: u64,
    pub total_calls: u64,
}

/// Stored bulkhead counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkheadRecord {
    pub active_calls: u64,
    pub total_calls: u64,
}
