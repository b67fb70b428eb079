//! Distributed backing store protocol
//!
//! [`DistributedStore`] is everything the cache, the lock and the resilience
//! primitives need from the shared store. Each state transition is a single
//! method, and each method is one atomic operation on the backend: a Lua
//! script on Redis, one mutex section on the in-memory store.
//!
//! Multi-key operations only ever receive keys that share a hash tag (see
//! [`crate::keys::KeySpace`]), so they stay on one shard in a cluster.

mod memory;
mod redis;
mod scripts;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::resilience::state::{
    BreakerDecision, BreakerPolicy, BreakerRecord, BulkheadAdmission, BulkheadRecord,
    CallOutcome, RateAlgorithm, RateRule, RateVerdict,
};

/// Errors talking to the distributed store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("distributed store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared handle to a store
pub type SharedStore = Arc<dyn DistributedStore>;

#[async_trait]
pub trait DistributedStore: Send + Sync + Debug {
    /// Short backend name for logs and metrics
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Read several keys.
    ///
    /// Backends that can pipeline override this with a single round trip;
    /// the default reads sequentially.
    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Write a value; `None` keeps it until deleted
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    /// Write an entry and record it in an index set, atomically.
    ///
    /// `key` and `index_key` must share a hash tag.
    async fn set_indexed(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        index_key: &str,
    ) -> StoreResult<()>;

    async fn index_add(&self, index_key: &str, member: &str) -> StoreResult<()>;

    async fn index_members(&self, index_key: &str) -> StoreResult<Vec<String>>;

    /// Delete every member of an index and the index itself, atomically.
    /// Returns how many members existed.
    async fn delete_indexed(&self, index_key: &str) -> StoreResult<u64>;

    /// SET NX PX
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete `key` only if it currently holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Reset the expiry of `key` only if it currently holds `expected`
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration)
    -> StoreResult<bool>;

    async fn breaker_transition(
        &self,
        key: &str,
        outcome: CallOutcome,
        policy: &BreakerPolicy,
        now_ms: u64,
    ) -> StoreResult<BreakerDecision>;

    async fn breaker_snapshot(&self, key: &str) -> StoreResult<BreakerRecord>;

    /// Check every rule and consume from all of them only if all allow.
    ///
    /// All rule keys must share a hash tag.
    async fn rate_limit(
        &self,
        algorithm: RateAlgorithm,
        rules: &[RateRule],
        now_ms: u64,
    ) -> StoreResult<RateVerdict>;

    /// Admit `permit` while fewer than `max_concurrency` unexpired leases are
    /// held. Each lease ends `lease` after `now_ms` unless released first.
    async fn bulkhead_acquire(
        &self,
        key: &str,
        permit: &str,
        max_concurrency: u64,
        lease: Duration,
        now_ms: u64,
    ) -> StoreResult<BulkheadAdmission>;

    /// Returns active calls after release
    async fn bulkhead_release(&self, key: &str, permit: &str, now_ms: u64) -> StoreResult<u64>;

    async fn bulkhead_snapshot(&self, key: &str, now_ms: u64) -> StoreResult<BulkheadRecord>;
}

/// Key of the sorted set holding a bulkhead's leases, scored by expiry
pub fn bulkhead_leases_key(key: &str) -> String {
    format!("{}:leases", key)
}

fn duration_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
