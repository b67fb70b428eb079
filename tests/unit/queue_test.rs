//! Delayed invalidation queue and batch analysis

use lighter_permission_cache::clock::ManualClock;
use lighter_permission_cache::config::InvalidationConfig;
use lighter_permission_cache::invalidation::{
    BatchDecision, BatchThresholds, InvalidationLevel, InvalidationQueue, QueueSnapshot, analyze,
};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_queue_never_exceeds_capacity() {
    let clock = Arc::new(ManualClock::new(0));
    let queue = InvalidationQueue::new(1000, clock);

    for i in 0..1001 {
        queue.push(format!("pc:perm:{{u{}}}:index", i), InvalidationLevel::L2, "role_change");
    }

    assert_eq!(queue.len(), 1000);
    assert_eq!(queue.total_delayed(), 1001);
    let stats = queue.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.capacity, 1000);
}

#[test]
fn test_queue_reports_oldest_age() {
    let clock = Arc::new(ManualClock::new(10_000));
    let queue = InvalidationQueue::new(10, clock.clone());

    queue.push("a", InvalidationLevel::L1, "test");
    clock.advance(Duration::from_secs(2));
    queue.push("b", InvalidationLevel::L1, "test");

    assert_eq!(queue.oldest_enqueued_at(), Some(10_000));
    assert_eq!(queue.stats().oldest_age_ms, 2_000);

    let drained = queue.drain(1);
    assert_eq!(drained[0].cache_key, "a");
    assert_eq!(drained[0].reason, "test");
    assert_eq!(queue.stats().oldest_age_ms, 0);
}

#[test]
fn test_thresholds_follow_configuration() {
    let config = InvalidationConfig {
        batch_size: 20,
        min_queue_size: 5,
        ..InvalidationConfig::default()
    };
    let thresholds = BatchThresholds::from(&config);

    let mut snapshot = QueueSnapshot {
        size: 4,
        capacity: config.max_queue_len,
        oldest_age_ms: 0,
        growth_rate: 0.0,
        processing_rate: 0.0,
    };
    assert_eq!(analyze(&snapshot, &thresholds), BatchDecision::Wait);

    snapshot.size = 60;
    assert_eq!(analyze(&snapshot, &thresholds), BatchDecision::Flush(60));

    snapshot.processing_rate = config.min_processing_rate / 2.0;
    assert_eq!(analyze(&snapshot, &thresholds), BatchDecision::Partial(20));

    snapshot.oldest_age_ms = config.max_delay_ms;
    assert_eq!(analyze(&snapshot, &thresholds), BatchDecision::Flush(60));
}

#[test]
fn test_level_parsing() {
    assert_eq!("L2".parse::<InvalidationLevel>(), Ok(InvalidationLevel::L2));
    assert_eq!("l1".parse::<InvalidationLevel>(), Ok(InvalidationLevel::L1));
    assert!("l3".parse::<InvalidationLevel>().is_err());
    assert_eq!(InvalidationLevel::L2.to_string(), "l2");
}
