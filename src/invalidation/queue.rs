use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{InvalidationLevel, InvalidationTask};
use crate::clock::SharedClock;

/// Counters and current shape of the queue
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub queue_size: usize,
    pub capacity: usize,
    /// Age of the oldest queued task
    pub oldest_age_ms: u64,
    /// Every enqueue attempt, including ones that pushed another task out
    pub total_delayed: u64,
    pub batches_flushed: u64,
    pub operations_flushed: u64,
    /// Mean operations per flushed batch
    pub operations_per_batch: f64,
    /// Tasks pushed out of a full buffer
    pub dropped: u64,
    /// Tasks whose key could not be parsed
    pub malformed: u64,
    /// Tasks put back after a failed batch
    pub requeued: u64,
}

/// Bounded FIFO of delayed invalidations
///
/// One mutex section per operation; overflow drops the oldest task.
#[derive(Debug)]
pub struct InvalidationQueue {
    tasks: Mutex<VecDeque<InvalidationTask>>,
    capacity: usize,
    clock: SharedClock,
    total_delayed: AtomicU64,
    batches_flushed: AtomicU64,
    operations_flushed: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
    requeued: AtomicU64,
}

impl InvalidationQueue {
    pub fn new(capacity: usize, clock: SharedClock) -> Self {
        let capacity = capacity.max(1);
        Self {
            tasks: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            clock,
            total_delayed: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            operations_flushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, VecDeque<InvalidationTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue one invalidation. Returns false when an older task was dropped
    /// to make room.
    pub fn push(
        &self,
        cache_key: impl Into<String>,
        level: InvalidationLevel,
        reason: impl Into<String>,
    ) -> bool {
        let task = InvalidationTask {
            cache_key: cache_key.into(),
            level,
            reason: reason.into(),
            enqueued_at_ms: self.clock.now_millis(),
        };
        self.total_delayed.fetch_add(1, Ordering::Relaxed);

        let dropped = {
            let mut tasks = self.tasks();
            let dropped = if tasks.len() >= self.capacity {
                tasks.pop_front()
            } else {
                None
            };
            tasks.push_back(task);
            dropped
        };

        match dropped {
            Some(old) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    dropped_key = %old.cache_key,
                    capacity = self.capacity,
                    "Invalidation queue full, oldest task dropped"
                );
                false
            }
            None => true,
        }
    }

    /// Remove up to `max` tasks from the front
    pub fn drain(&self, max: usize) -> Vec<InvalidationTask> {
        let mut tasks = self.tasks();
        let n = max.min(tasks.len());
        tasks.drain(..n).collect()
    }

    /// Put tasks back at the front, oldest first, without exceeding capacity.
    /// Returns how many were kept.
    pub fn requeue(&self, failed: Vec<InvalidationTask>) -> usize {
        let mut tasks = self.tasks();
        let room = self.capacity.saturating_sub(tasks.len());
        let total = failed.len();
        let kept = total.min(room);

        // Keep the newest of the failed tasks when there is not room for all
        for task in failed.into_iter().skip(total - kept).rev() {
            tasks.push_front(task);
        }
        drop(tasks);

        self.requeued.fetch_add(kept as u64, Ordering::Relaxed);
        self.dropped.fetch_add((total - kept) as u64, Ordering::Relaxed);
        kept
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }

    pub fn oldest_enqueued_at(&self) -> Option<u64> {
        self.tasks().front().map(|task| task.enqueued_at_ms)
    }

    pub fn total_delayed(&self) -> u64 {
        self.total_delayed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_batch(&self, operations: usize) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.operations_flushed
            .fetch_add(operations as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self, count: usize) {
        self.malformed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> QueueStats {
        let (queue_size, oldest) = {
            let tasks = self.tasks();
            (tasks.len(), tasks.front().map(|task| task.enqueued_at_ms))
        };
        let batches = self.batches_flushed.load(Ordering::Relaxed);
        let operations = self.operations_flushed.load(Ordering::Relaxed);

        QueueStats {
            queue_size,
            capacity: self.capacity,
            oldest_age_ms: oldest
                .map(|at| self.clock.now_millis().saturating_sub(at))
                .unwrap_or(0),
            total_delayed: self.total_delayed(),
            batches_flushed: batches,
            operations_flushed: operations,
            operations_per_batch: if batches == 0 {
                0.0
            } else {
                operations as f64 / batches as f64
            },
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}
