//! Batch sizing for the drain worker
//!
//! A pure function of the queue's state: it never touches the queue, so
//! every branch is testable with plain values.

use crate::config::InvalidationConfig;

/// Fill ratio at which the queue is flushed regardless of other signals
pub const FLUSH_FILL_RATIO: f64 = 0.8;

/// What the worker knows about the queue at a tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueSnapshot {
    pub size: usize,
    pub capacity: usize,
    /// Age of the oldest queued task
    pub oldest_age_ms: u64,
    /// Tasks per second added since the previous drain
    pub growth_rate: f64,
    /// Moving average of tasks per second applied; zero until measured
    pub processing_rate: f64,
}

impl QueueSnapshot {
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.size as f64 / self.capacity as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchThresholds {
    pub batch_size: usize,
    pub min_queue_size: usize,
    pub max_growth_rate: f64,
    pub min_processing_rate: f64,
    pub max_delay_ms: u64,
}

impl From<&InvalidationConfig> for BatchThresholds {
    fn from(config: &InvalidationConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            min_queue_size: config.min_queue_size,
            max_growth_rate: config.max_growth_rate,
            min_processing_rate: config.min_processing_rate,
            max_delay_ms: config.max_delay_ms,
        }
    }
}

/// How many tasks to drain this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDecision {
    Wait,
    /// Drain one batch only
    Partial(usize),
    /// Drain everything queued
    Flush(usize),
}

impl BatchDecision {
    pub fn count(&self) -> usize {
        match self {
            BatchDecision::Wait => 0,
            BatchDecision::Partial(n) | BatchDecision::Flush(n) => *n,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchDecision::Wait => "wait",
            BatchDecision::Partial(_) => "partial",
            BatchDecision::Flush(_) => "flush",
        }
    }
}

/// Decide how much of the queue to drain.
///
/// Staleness bounds come first: an old task or a nearly full buffer forces a
/// full flush. Otherwise small queues and bursts still growing wait to form
/// larger batches, and a slow store gets one batch per tick.
pub fn analyze(snapshot: &QueueSnapshot, thresholds: &BatchThresholds) -> BatchDecision {
    let size = snapshot.size;
    if size == 0 {
        return BatchDecision::Wait;
    }

    if snapshot.oldest_age_ms >= thresholds.max_delay_ms {
        return BatchDecision::Flush(size);
    }

    if snapshot.fill_ratio() >= FLUSH_FILL_RATIO {
        return BatchDecision::Flush(size);
    }

    if size < thresholds.min_queue_size {
        return BatchDecision::Wait;
    }

    if snapshot.growth_rate > thresholds.max_growth_rate {
        return BatchDecision::Wait;
    }

    if snapshot.processing_rate > 0.0 && snapshot.processing_rate < thresholds.min_processing_rate {
        return BatchDecision::Partial(size.min(thresholds.batch_size));
    }

    BatchDecision::Flush(size)
}
