//! Two-level permission cache
//!
//! - **L1**: [`LocalCache`], per-process, uncompressed entries
//! - **L2**: the distributed store, bincode entries compressed past a
//!   threshold (see [`codec`])
//!
//! [`PermissionCache`] ties both levels together with a distributed lock on
//! misses, a resilience guard around every L2 call and the delayed
//! invalidation queue.

pub mod codec;
mod hybrid;
mod local;

pub use hybrid::{InvalidationReport, PermissionCache, RoleInvalidationReport, WriteOutcome};
pub use local::LocalCache;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Opaque permission names held by a subject in one scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<String>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, permission: &str) -> bool {
        self.0.contains(permission)
    }

    pub fn insert(&mut self, permission: impl Into<String>) -> bool {
        self.0.insert(permission.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl IntoIterator for PermissionSet {
    type Item = String;
    type IntoIter = std::collections::btree_set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A cached permission set with its write time and lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub permissions: PermissionSet,
    pub written_at_ms: u64,
    pub ttl_ms: u64,
}

impl CacheEntry {
    pub fn new(permissions: PermissionSet, written_at_ms: u64, ttl: Duration) -> Self {
        Self {
            permissions,
            written_at_ms,
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.written_at_ms.saturating_add(self.ttl_ms)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms()
    }
}

/// Statistics about cache performance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Total number of cache hits (successful gets)
    pub hits: u64,

    /// Total number of cache misses (failed gets)
    pub misses: u64,

    /// Total number of evictions (expired or over capacity)
    pub evictions: u64,

    /// Current number of items in the cache
    pub size: usize,

    /// Hit rate as a fraction (0.0 to 1.0)
    pub hit_rate: f64,
}

impl CacheStats {
    /// Calculate hit rate from hits and misses
    pub fn calculate_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
    }
}

/// Counters of the distributed level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2Stats {
    pub hits: u64,
    pub misses: u64,
    /// Store or codec failures
    pub errors: u64,
    /// Calls turned away by the L2 guard
    pub skipped: u64,
    pub writes: u64,
}

/// Snapshot of both levels
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionCacheStats {
    pub l1: CacheStats,
    pub l2: L2Stats,
    /// `get` calls answered by either level
    pub hit_rate: f64,
}
