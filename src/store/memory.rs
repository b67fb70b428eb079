use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{DistributedStore, StoreError, StoreResult, duration_millis};
use crate::clock::{SharedClock, SystemClock};
use crate::resilience::state::{
    BreakerDecision, BreakerPolicy, BreakerRecord, BucketRecord, BulkheadAdmission,
    BulkheadRecord, CallOutcome, RateAlgorithm, RateRule, RateVerdict, breaker_step,
    sliding_count, window_index,
};

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Set(HashSet<String>),
    Breaker(BreakerRecord),
    Bucket(BucketRecord),
    Counter(u64),
    Bulkhead(Leases),
}

/// Bulkhead leases by permit id, each with its own expiry
#[derive(Debug, Clone, Default)]
struct Leases {
    held: HashMap<String, u64>,
    total_calls: u64,
}

impl Leases {
    fn prune(&mut self, now_ms: u64) {
        self.held.retain(|_, until| *until > now_ms);
    }

    fn active(&self) -> u64 {
        self.held.len() as u64
    }
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<u64>,
}

impl Slot {
    fn new(value: Value, expires_at: Option<u64>) -> Self {
        Self { value, expires_at }
    }

    fn expired(&self, now_ms: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }
}

enum Plan {
    Bucket { key: String, bucket: BucketRecord, ttl_ms: u64 },
    Counter { key: String, ttl_ms: u64 },
}

/// Process-local store with the same atomic semantics as [`super::RedisStore`]
///
/// Used when Redis is disabled and throughout the test suite. Expiry follows
/// the injected clock, and the store can be switched off to simulate an
/// outage.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Slot>>,
    clock: SharedClock,
    available: AtomicBool,
    round_trips: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
            round_trips: AtomicU64::new(0),
        }
    }

    /// Simulate the store going down (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Operations attempted against this store, including failed ones
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    /// Whether `key` currently exists
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        self.entries()
            .get(key)
            .is_some_and(|slot| !slot.expired(now))
    }

    /// Remaining time to live of `key`; `None` if missing or persistent
    pub fn expires_in(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        self.entries()
            .get(key)
            .filter(|slot| !slot.expired(now))
            .and_then(|slot| slot.expires_at)
            .map(|at| Duration::from_millis(at - now))
    }

    /// Live keys, in no particular order
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now_millis();
        self.entries()
            .iter()
            .filter(|(_, slot)| !slot.expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the round trip and fail if the store is switched off
    fn enter(&self) -> StoreResult<u64> {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        if !self.is_available() {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(self.clock.now_millis())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn live<'a>(map: &'a mut HashMap<String, Slot>, key: &str, now_ms: u64) -> Option<&'a mut Slot> {
    if map.get(key).is_some_and(|slot| slot.expired(now_ms)) {
        map.remove(key);
    }
    map.get_mut(key)
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Protocol(format!(
        "WRONGTYPE operation against a key holding the wrong kind of value: {}",
        key
    ))
}

fn read_bytes(map: &mut HashMap<String, Slot>, key: &str, now_ms: u64) -> StoreResult<Option<Vec<u8>>> {
    match live(map, key, now_ms) {
        None => Ok(None),
        Some(Slot {
            value: Value::Bytes(bytes),
            ..
        }) => Ok(Some(bytes.clone())),
        Some(_) => Err(wrong_type(key)),
    }
}

fn read_counter(map: &mut HashMap<String, Slot>, key: &str, now_ms: u64) -> u64 {
    match live(map, key, now_ms) {
        Some(Slot {
            value: Value::Counter(count),
            ..
        }) => *count,
        _ => 0,
    }
}

#[async_trait]
impl DistributedStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = self.enter()?;
        read_bytes(&mut self.entries(), key, now)
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        let now = self.enter()?;
        let mut map = self.entries();
        keys.iter()
            .map(|key| read_bytes(&mut map, key, now))
            .collect()
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let now = self.enter()?;
        let expires_at = ttl.map(|ttl| now + duration_millis(ttl));
        self.entries().insert(
            key.to_string(),
            Slot::new(Value::Bytes(value.to_vec()), expires_at),
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        let now = self.enter()?;
        let mut map = self.entries();
        let mut deleted = 0;
        for key in keys {
            if let Some(slot) = map.remove(key) {
                if !slot.expired(now) {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn set_indexed(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        index_key: &str,
    ) -> StoreResult<()> {
        let now = self.enter()?;
        let expires_at = now + duration_millis(ttl);
        let mut map = self.entries();

        match live(&mut map, index_key, now) {
            Some(Slot {
                value: Value::Set(members),
                expires_at: index_expiry,
            }) => {
                members.insert(key.to_string());
                if index_expiry.is_some_and(|at| at < expires_at) {
                    *index_expiry = Some(expires_at);
                }
            }
            Some(_) => return Err(wrong_type(index_key)),
            None => {
                let members = HashSet::from([key.to_string()]);
                map.insert(
                    index_key.to_string(),
                    Slot::new(Value::Set(members), Some(expires_at)),
                );
            }
        }

        map.insert(
            key.to_string(),
            Slot::new(Value::Bytes(value.to_vec()), Some(expires_at)),
        );
        Ok(())
    }

    async fn index_add(&self, index_key: &str, member: &str) -> StoreResult<()> {
        let now = self.enter()?;
        let mut map = self.entries();
        match live(&mut map, index_key, now) {
            Some(Slot {
                value: Value::Set(members),
                ..
            }) => {
                members.insert(member.to_string());
            }
            Some(_) => return Err(wrong_type(index_key)),
            None => {
                map.insert(
                    index_key.to_string(),
                    Slot::new(Value::Set(HashSet::from([member.to_string()])), None),
                );
            }
        }
        Ok(())
    }

    async fn index_members(&self, index_key: &str) -> StoreResult<Vec<String>> {
        let now = self.enter()?;
        match live(&mut self.entries(), index_key, now) {
            None => Ok(Vec::new()),
            Some(Slot {
                value: Value::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(wrong_type(index_key)),
        }
    }

    async fn delete_indexed(&self, index_key: &str) -> StoreResult<u64> {
        let now = self.enter()?;
        let mut map = self.entries();
        let members = match live(&mut map, index_key, now) {
            None => return Ok(0),
            Some(Slot {
                value: Value::Set(members),
                ..
            }) => std::mem::take(members),
            Some(_) => return Err(wrong_type(index_key)),
        };

        let mut deleted = 0;
        for member in &members {
            if let Some(slot) = map.remove(member) {
                if !slot.expired(now) {
                    deleted += 1;
                }
            }
        }
        map.remove(index_key);
        Ok(deleted)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = self.enter()?;
        let mut map = self.entries();
        if live(&mut map, key, now).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Slot::new(
                Value::Bytes(value.as_bytes().to_vec()),
                Some(now + duration_millis(ttl)),
            ),
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let now = self.enter()?;
        let mut map = self.entries();
        let matches = matches!(
            live(&mut map, key, now),
            Some(Slot { value: Value::Bytes(bytes), .. }) if bytes.as_slice() == expected.as_bytes()
        );
        if matches {
            map.remove(key);
        }
        Ok(matches)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = self.enter()?;
        let mut map = self.entries();
        match live(&mut map, key, now) {
            Some(Slot {
                value: Value::Bytes(bytes),
                expires_at,
            }) if bytes.as_slice() == expected.as_bytes() => {
                *expires_at = Some(now + duration_millis(ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn breaker_transition(
        &self,
        key: &str,
        outcome: CallOutcome,
        policy: &BreakerPolicy,
        now_ms: u64,
    ) -> StoreResult<BreakerDecision> {
        let now = self.enter()?;
        let mut map = self.entries();
        let mut record = match live(&mut map, key, now) {
            None => BreakerRecord::default(),
            Some(Slot {
                value: Value::Breaker(record),
                ..
            }) => *record,
            Some(_) => return Err(wrong_type(key)),
        };

        let decision = breaker_step(&mut record, outcome, policy, now_ms);
        map.insert(key.to_string(), Slot::new(Value::Breaker(record), None));
        Ok(decision)
    }

    async fn breaker_snapshot(&self, key: &str) -> StoreResult<BreakerRecord> {
        let now = self.enter()?;
        match live(&mut self.entries(), key, now) {
            None => Ok(BreakerRecord::default()),
            Some(Slot {
                value: Value::Breaker(record),
                ..
            }) => Ok(*record),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn rate_limit(
        &self,
        algorithm: RateAlgorithm,
        rules: &[RateRule],
        now_ms: u64,
    ) -> StoreResult<RateVerdict> {
        let now = self.enter()?;
        let mut map = self.entries();

        let mut plans = Vec::with_capacity(rules.len());
        let mut denied: Option<usize> = None;
        let mut remaining: Option<u64> = None;
        let mut retry_after_ms = 0;

        for (i, rule) in rules.iter().enumerate() {
            let window = rule.window_ms.max(1);
            let (allowed, left, wait) = match algorithm {
                RateAlgorithm::TokenBucket => {
                    let mut bucket = match live(&mut map, &rule.key, now) {
                        Some(Slot {
                            value: Value::Bucket(bucket),
                            ..
                        }) => *bucket,
                        _ => BucketRecord::full(rule, now_ms),
                    };
                    bucket.refill(rule, now_ms);

                    let verdict = if bucket.tokens >= 1.0 {
                        (true, (bucket.tokens - 1.0).floor() as u64, 0)
                    } else {
                        (false, 0, bucket.wait_for_token_ms(rule))
                    };
                    let refill_ms =
                        (rule.burst as f64 * window as f64 / rule.limit.max(1) as f64).ceil() as u64;
                    plans.push(Plan::Bucket {
                        key: rule.key.clone(),
                        bucket,
                        ttl_ms: refill_ms + window,
                    });
                    verdict
                }
                RateAlgorithm::SlidingWindow | RateAlgorithm::FixedWindow => {
                    let index = window_index(now_ms, window);
                    let (current_key, previous_key) = rule.window_keys(now_ms);
                    let current = read_counter(&mut map, &current_key, now);
                    let used = if algorithm == RateAlgorithm::SlidingWindow {
                        let previous = read_counter(&mut map, &previous_key, now);
                        sliding_count(previous, current, now_ms, window)
                    } else {
                        current as f64
                    };

                    plans.push(Plan::Counter {
                        key: current_key,
                        ttl_ms: window * 2,
                    });
                    if used + 1.0 <= rule.limit as f64 {
                        (true, (rule.limit as f64 - used - 1.0).floor() as u64, 0)
                    } else {
                        (false, 0, (index + 1) * window - now_ms)
                    }
                }
            };

            if !allowed {
                denied.get_or_insert(i);
                retry_after_ms = retry_after_ms.max(wait);
            }
            remaining = Some(remaining.map_or(left, |r| r.min(left)));
        }

        if let Some(index) = denied {
            return Ok(RateVerdict {
                allowed: false,
                limited_by: Some(index),
                remaining: 0,
                retry_after_ms,
            });
        }

        for plan in plans {
            match plan {
                Plan::Bucket {
                    key,
                    mut bucket,
                    ttl_ms,
                } => {
                    bucket.tokens -= 1.0;
                    map.insert(key, Slot::new(Value::Bucket(bucket), Some(now + ttl_ms)));
                }
                Plan::Counter { key, ttl_ms } => {
                    let count = read_counter(&mut map, &key, now) + 1;
                    map.insert(key, Slot::new(Value::Counter(count), Some(now + ttl_ms)));
                }
            }
        }

        Ok(RateVerdict {
            allowed: true,
            limited_by: None,
            remaining: remaining.unwrap_or(0),
            retry_after_ms: 0,
        })
    }

    async fn bulkhead_acquire(
        &self,
        key: &str,
        permit: &str,
        max_concurrency: u64,
        lease: Duration,
        now_ms: u64,
    ) -> StoreResult<BulkheadAdmission> {
        let now = self.enter()?;
        let mut map = self.entries();
        if live(&mut map, key, now).is_none() {
            map.insert(key.to_string(), Slot::new(Value::Bulkhead(Leases::default()), None));
        }
        let leases = match map.get_mut(key) {
            Some(Slot {
                value: Value::Bulkhead(leases),
                ..
            }) => leases,
            _ => return Err(wrong_type(key)),
        };
        leases.prune(now_ms);

        let admitted = leases.active() < max_concurrency;
        if admitted {
            leases
                .held
                .insert(permit.to_string(), now_ms + duration_millis(lease));
            leases.total_calls += 1;
        }
        Ok(BulkheadAdmission {
            admitted,
            active_calls: leases.active(),
            total_calls: leases.total_calls,
        })
    }

    async fn bulkhead_release(&self, key: &str, permit: &str, now_ms: u64) -> StoreResult<u64> {
        let now = self.enter()?;
        match live(&mut self.entries(), key, now) {
            Some(Slot {
                value: Value::Bulkhead(leases),
                ..
            }) => {
                leases.held.remove(permit);
                leases.prune(now_ms);
                Ok(leases.active())
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn bulkhead_snapshot(&self, key: &str, now_ms: u64) -> StoreResult<BulkheadRecord> {
        let now = self.enter()?;
        match live(&mut self.entries(), key, now) {
            None => Ok(BulkheadRecord::default()),
            Some(Slot {
                value: Value::Bulkhead(leases),
                ..
            }) => Ok(BulkheadRecord {
                active_calls: leases.held.values().filter(|until| **until > now_ms).count() as u64,
                total_calls: leases.total_calls,
            }),
            Some(_) => Err(wrong_type(key)),
        }
    }
}
