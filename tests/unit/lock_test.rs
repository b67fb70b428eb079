//! Distributed lock behaviour on the in-memory store

use lighter_permission_cache::clock::ManualClock;
use lighter_permission_cache::lock::{DistributedLock, LockError, LockOptions};
use lighter_permission_cache::store::{MemoryStore, SharedStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn options() -> LockOptions {
    LockOptions {
        ttl: Duration::from_secs(5),
        retry_count: 0,
        retry_interval: Duration::from_millis(1),
        renew_interval: None,
    }
}

fn store() -> (Arc<ManualClock>, SharedStore) {
    let clock = Arc::new(ManualClock::new(1_000));
    let store: SharedStore = Arc::new(MemoryStore::with_clock(clock.clone()));
    (clock, store)
}

#[tokio::test]
async fn test_second_handle_is_refused_until_release() {
    let (_clock, store) = store();
    let first = DistributedLock::new(store.clone(), "pc:lock:{job}", options());
    let second = DistributedLock::new(store.clone(), "pc:lock:{job}", options());

    assert!(first.acquire().await);
    assert!(!second.acquire().await);

    assert!(first.release().await);
    assert!(second.acquire().await);
    assert_ne!(first.owner_token(), second.owner_token());
}

#[tokio::test]
async fn test_only_one_of_many_concurrent_callers_wins() {
    let (_clock, store) = store();
    let winners = Arc::new(AtomicUsize::new(0));
    let mut locks = Vec::new();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let lock = Arc::new(DistributedLock::new(store.clone(), "pc:lock:{race}", options()));
            locks.push(lock.clone());
            let winners = winners.clone();
            tokio::spawn(async move {
                if lock.acquire().await {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(locks.iter().filter(|lock| lock.is_held()).count(), 1);
}

#[tokio::test]
async fn test_expired_lease_can_be_taken_over() {
    let (clock, store) = store();
    let stale = DistributedLock::new(store.clone(), "pc:lock:{lease}", options());
    let fresh = DistributedLock::new(store.clone(), "pc:lock:{lease}", options());

    assert!(stale.acquire().await);
    clock.advance(Duration::from_secs(6));
    assert!(fresh.acquire().await);

    // The stale owner cannot delete the new owner's key
    assert!(!stale.release().await);
    assert!(fresh.is_held());
    assert!(fresh.release().await);
}

#[tokio::test]
async fn test_with_lock_reports_contention() {
    let (_clock, store) = store();
    let holder = DistributedLock::new(store.clone(), "pc:lock:{scoped}", options());
    let other = DistributedLock::new(store.clone(), "pc:lock:{scoped}", options());
    assert!(holder.acquire().await);

    let result = other.with_lock(async { "ran" }).await;
    assert_eq!(
        result,
        Err(LockError::NotAcquired {
            key: "pc:lock:{scoped}".to_string()
        })
    );

    holder.release().await;
    assert_eq!(other.with_lock(async { "ran" }).await, Ok("ran"));
    assert!(!other.is_held());
}
