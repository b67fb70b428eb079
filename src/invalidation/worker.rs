//! Background drain of the delayed invalidation queue

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::analysis::{BatchDecision, BatchThresholds, QueueSnapshot, analyze};
use super::{
    InvalidationExecutor, InvalidationLevel, InvalidationQueue, InvalidationTask, QueueStats,
};
use crate::clock::SharedClock;
use crate::collaborators::SharedMonitor;
use crate::config::InvalidationConfig;
use crate::keys::ParsedKey;

/// Weight of the newest sample in the processing rate average
const RATE_SMOOTHING: f64 = 0.3;

/// Outcome of one drain tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub decision: BatchDecision,
    /// Tasks taken off the queue
    pub drained: usize,
    /// Tasks applied successfully
    pub applied: usize,
    /// Items the executor reported removed
    pub removed: u64,
    pub malformed: usize,
    /// Tasks put back after a failed chunk
    pub requeued: usize,
}

impl DrainReport {
    fn waiting(decision: BatchDecision) -> Self {
        Self {
            decision,
            drained: 0,
            applied: 0,
            removed: 0,
            malformed: 0,
            requeued: 0,
        }
    }
}

/// Queue counters together with the drain settings they are judged against
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStats {
    #[serde(flatten)]
    pub queue: QueueStats,
    pub batch_size: usize,
    pub interval_ms: u64,
    pub max_delay_ms: u64,
    pub processing_rate: f64,
}

#[derive(Debug, Default)]
struct RateState {
    last_tick_ms: Option<u64>,
    total_delayed_at_last_tick: u64,
    processing_rate: f64,
}

/// Drains the queue through an executor on a fixed interval
pub struct InvalidationWorker {
    queue: Arc<InvalidationQueue>,
    executor: Arc<dyn InvalidationExecutor>,
    config: InvalidationConfig,
    thresholds: BatchThresholds,
    clock: SharedClock,
    monitor: SharedMonitor,
    rates: Mutex<RateState>,
}

impl InvalidationWorker {
    pub fn new(
        queue: Arc<InvalidationQueue>,
        executor: Arc<dyn InvalidationExecutor>,
        config: InvalidationConfig,
        clock: SharedClock,
        monitor: SharedMonitor,
    ) -> Self {
        Self {
            thresholds: BatchThresholds::from(&config),
            queue,
            executor,
            config,
            clock,
            monitor,
            rates: Mutex::new(RateState::default()),
        }
    }

    fn rates(&self) -> MutexGuard<'_, RateState> {
        self.rates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current moving average of tasks applied per second
    pub fn processing_rate(&self) -> f64 {
        self.rates().processing_rate
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            queue: self.queue.stats(),
            batch_size: self.config.batch_size,
            interval_ms: self.config.interval_ms,
            max_delay_ms: self.config.max_delay_ms,
            processing_rate: self.processing_rate(),
        }
    }

    fn snapshot(&self, now: u64) -> QueueSnapshot {
        let stats = self.queue.stats();
        let rates = self.rates();

        // Arrivals since the previous tick, per second
        let growth_rate = match rates.last_tick_ms {
            Some(last) if now > last => {
                let arrived = stats
                    .total_delayed
                    .saturating_sub(rates.total_delayed_at_last_tick);
                arrived as f64 * 1_000.0 / (now - last) as f64
            }
            _ => 0.0,
        };

        QueueSnapshot {
            size: stats.queue_size,
            capacity: stats.capacity,
            oldest_age_ms: stats.oldest_age_ms,
            growth_rate,
            processing_rate: rates.processing_rate,
        }
    }

    /// Run one analysis and drain cycle
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> DrainReport {
        let now = self.clock.now_millis();
        let snapshot = self.snapshot(now);
        let decision = analyze(&snapshot, &self.thresholds);

        let report = match decision {
            BatchDecision::Wait => DrainReport::waiting(decision),
            BatchDecision::Partial(n) | BatchDecision::Flush(n) => {
                let started = Instant::now();
                let tasks = self.queue.drain(n);
                let report = self.apply(decision, tasks).await;
                self.record_processing(report.applied, started);
                report
            }
        };
        self.record_tick(now);

        if report.drained > 0 {
            tracing::debug!(
                decision = decision.as_str(),
                drained = report.drained,
                applied = report.applied,
                removed = report.removed,
                malformed = report.malformed,
                requeued = report.requeued,
                "Invalidation batch processed"
            );
            self.monitor.record_metric(
                "invalidation_batch_size",
                report.applied as f64,
                &[("decision", decision.as_str().to_string())],
            );
            self.monitor.record_metric(
                "invalidation_queue_size",
                self.queue.len() as f64,
                &[],
            );
        }

        report
    }

    async fn apply(&self, decision: BatchDecision, tasks: Vec<InvalidationTask>) -> DrainReport {
        let mut report = DrainReport::waiting(decision);
        report.drained = tasks.len();

        let key_space = self.executor.key_space().clone();
        let mut parsed: Vec<(InvalidationTask, ParsedKey)> = Vec::with_capacity(tasks.len());
        for task in tasks {
            match key_space.parse(&task.cache_key) {
                Ok(key) => parsed.push((task, key)),
                Err(e) => {
                    tracing::warn!(
                        cache_key = %task.cache_key,
                        error = %e,
                        "Skipping malformed invalidation task"
                    );
                    report.malformed += 1;
                }
            }
        }
        self.queue.record_malformed(report.malformed);

        let mut failed = Vec::new();
        for chunk in parsed.chunks(self.thresholds.batch_size) {
            for level in [InvalidationLevel::L1, InvalidationLevel::L2] {
                let (tasks, keys): (Vec<&InvalidationTask>, Vec<ParsedKey>) = chunk
                    .iter()
                    .filter(|(task, _)| task.level == level)
                    .map(|(task, key)| (task, key.clone()))
                    .unzip();
                if keys.is_empty() {
                    continue;
                }

                match self.executor.execute(level, &keys).await {
                    Ok(removed) => {
                        report.applied += keys.len();
                        report.removed += removed;
                        self.queue.record_batch(keys.len());
                    }
                    Err(e) => {
                        tracing::warn!(
                            level = level.as_str(),
                            operations = keys.len(),
                            error = %e,
                            "Invalidation batch failed, requeueing"
                        );
                        failed.extend(tasks.into_iter().cloned());
                    }
                }
            }
        }

        if !failed.is_empty() {
            report.requeued = self.queue.requeue(failed);
        }
        report
    }

    fn record_processing(&self, applied: usize, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64();
        if applied == 0 || elapsed <= 0.0 {
            return;
        }
        let sample = applied as f64 / elapsed;
        let mut rates = self.rates();
        rates.processing_rate = if rates.processing_rate == 0.0 {
            sample
        } else {
            RATE_SMOOTHING * sample + (1.0 - RATE_SMOOTHING) * rates.processing_rate
        };
    }

    fn record_tick(&self, now: u64) {
        let total_delayed = self.queue.total_delayed();
        let mut rates = self.rates();
        rates.last_tick_ms = Some(now);
        rates.total_delayed_at_last_tick = total_delayed;
    }

    /// Drain everything now, ignoring the analysis. Used on shutdown.
    pub async fn flush(&self) -> DrainReport {
        let size = self.queue.len();
        if size == 0 {
            return DrainReport::waiting(BatchDecision::Wait);
        }
        let decision = BatchDecision::Flush(size);
        let tasks = self.queue.drain(size);
        self.apply(decision, tasks).await
    }

    /// Start the background loop.
    ///
    /// The loop ticks every `interval` and stops as soon as the handle
    /// signals shutdown; queued tasks are flushed once on the way out.
    pub fn start(self: Arc<Self>) -> WorkerHandle {
        tracing::info!(
            interval_ms = self.config.interval_ms,
            batch_size = self.config.batch_size,
            capacity = self.queue.capacity(),
            "Starting invalidation worker"
        );

        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Invalidation worker received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }

            let report = self.flush().await;
            if report.drained > 0 {
                tracing::info!(
                    applied = report.applied,
                    requeued = report.requeued,
                    "Invalidation queue flushed on shutdown"
                );
            }
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            handle,
        }
    }
}

impl std::fmt::Debug for InvalidationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationWorker")
            .field("config", &self.config)
            .field("queue_size", &self.queue.len())
            .field("processing_rate", &self.processing_rate())
            .finish()
    }
}

/// Stop signal and join handle of a running worker
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<()>,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the loop and wait for it to finish its final flush
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Invalidation worker ended abnormally");
        }
    }
}
