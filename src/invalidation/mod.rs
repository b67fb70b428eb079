//! Delayed invalidation
//!
//! Invalidations that cannot or should not hit the store right away (store
//! outage, large role fan-outs) are queued in a bounded ring buffer. A
//! background worker drains it in batches sized by [`analysis::analyze`]
//! and applies them through an [`InvalidationExecutor`].

pub mod analysis;
mod queue;
mod worker;

pub use analysis::{BatchDecision, BatchThresholds, QueueSnapshot, analyze};
pub use queue::{InvalidationQueue, QueueStats};
pub use worker::{DrainReport, InvalidationWorker, WorkerHandle, WorkerStats};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::keys::{KeySpace, ParsedKey};
use crate::store::StoreResult;

/// Which cache level a task targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationLevel {
    L1,
    L2,
}

impl InvalidationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationLevel::L1 => "l1",
            InvalidationLevel::L2 => "l2",
        }
    }
}

impl fmt::Display for InvalidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvalidationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l1" => Ok(InvalidationLevel::L1),
            "l2" => Ok(InvalidationLevel::L2),
            other => Err(format!("unknown cache level {:?}", other)),
        }
    }
}

/// One queued invalidation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationTask {
    /// Rendered entry key or subject index key
    pub cache_key: String,
    pub level: InvalidationLevel,
    pub reason: String,
    pub enqueued_at_ms: u64,
}

/// Applies drained invalidations
#[async_trait]
pub trait InvalidationExecutor: Send + Sync {
    /// Namespace the queued keys were rendered in
    fn key_space(&self) -> &KeySpace;

    /// Apply one chunk of parsed keys at `level`, returning how many cached
    /// items were removed. An error leaves the chunk to be retried.
    async fn execute(&self, level: InvalidationLevel, keys: &[ParsedKey]) -> StoreResult<u64>;
}
