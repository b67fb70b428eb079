use anyhow::Context;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult, Script};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use super::scripts;
use super::{DistributedStore, StoreError, StoreResult, bulkhead_leases_key, duration_millis};
use crate::resilience::state::{
    BreakerDecision, BreakerPolicy, BreakerRecord, BulkheadAdmission, BulkheadRecord,
    CallOutcome, CircuitState, RateAlgorithm, RateRule, RateVerdict, Transition,
};

/// Loaded once per store; `Script` caches the SHA and falls back to EVAL
struct Scripts {
    set_indexed: Script,
    delete_indexed: Script,
    compare_and_delete: Script,
    compare_and_expire: Script,
    breaker_transition: Script,
    rate_limit: Script,
    bulkhead_acquire: Script,
    bulkhead_release: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            set_indexed: Script::new(scripts::SET_INDEXED),
            delete_indexed: Script::new(scripts::DELETE_INDEXED),
            compare_and_delete: Script::new(scripts::COMPARE_AND_DELETE),
            compare_and_expire: Script::new(scripts::COMPARE_AND_EXPIRE),
            breaker_transition: Script::new(scripts::BREAKER_TRANSITION),
            rate_limit: Script::new(scripts::RATE_LIMIT),
            bulkhead_acquire: Script::new(scripts::BULKHEAD_ACQUIRE),
            bulkhead_release: Script::new(scripts::BULKHEAD_RELEASE),
        }
    }
}

/// Redis-backed distributed store
///
/// Features:
/// - Async operations using redis::aio::ConnectionManager
/// - Automatic reconnection
/// - Pipelined multi-key reads
/// - One Lua script per atomic state transition
/// - Every operation bounded by `operation_timeout`
pub struct RedisStore {
    conn_manager: ConnectionManager,
    operation_timeout: Duration,
    scripts: Scripts,
}

impl RedisStore {
    /// Connect with default timeouts (3s connect, 500ms per operation)
    pub async fn new(url: &str) -> anyhow::Result<Self> {
        Self::with_timeout(url, Duration::from_secs(3), Duration::from_millis(500)).await
    }

    /// Connect with explicit timeouts
    ///
    /// # Example
    /// ```no_run
    /// use lighter_permission_cache::store::RedisStore;
    /// use std::time::Duration;
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let store = RedisStore::with_timeout(
    ///         "redis://localhost:6379",
    ///         Duration::from_secs(5),
    ///         Duration::from_millis(250),
    ///     ).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn with_timeout(
        url: &str,
        connection_timeout: Duration,
        operation_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::open(url).context("Failed to create Redis client")?;

        let conn_manager = timeout(connection_timeout, ConnectionManager::new(client))
            .await
            .context(format!(
                "Redis connection timeout after {:?}. Check Redis is running at: {}",
                connection_timeout, url
            ))?
            .context("Failed to create Redis connection manager")?;

        Ok(Self {
            conn_manager,
            operation_timeout,
            scripts: Scripts::load(),
        })
    }

    fn connection(&self) -> ConnectionManager {
        self.conn_manager.clone()
    }

    async fn run<T, F>(&self, operation: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match timeout(self.operation_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout {
                operation,
                after: self.operation_timeout,
            }),
        }
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DistributedStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    #[tracing::instrument(skip(self), fields(store_key = %key))]
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.connection();
        self.run("get", async move {
            redis::cmd("GET").arg(key).query_async(&mut conn).await
        })
        .await
    }

    #[tracing::instrument(skip(self, keys), fields(key_count = keys.len()))]
    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("GET").arg(key);
        }

        let mut conn = self.connection();
        self.run("get_many", async move { pipe.query_async(&mut conn).await })
            .await
    }

    #[tracing::instrument(skip(self, value), fields(store_key = %key, bytes = value.len()))]
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(duration_millis(ttl));
        }

        let mut conn = self.connection();
        self.run("set", async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        // One DEL per key keeps the call valid when keys span slots
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("DEL").arg(key);
        }

        let mut conn = self.connection();
        let deleted: Vec<u64> = self
            .run("delete", async move { pipe.query_async(&mut conn).await })
            .await?;
        Ok(deleted.into_iter().sum())
    }

    #[tracing::instrument(skip(self, value), fields(store_key = %key, index = %index_key))]
    async fn set_indexed(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        index_key: &str,
    ) -> StoreResult<()> {
        let mut invocation = self.scripts.set_indexed.prepare_invoke();
        invocation
            .key(key)
            .key(index_key)
            .arg(value)
            .arg(duration_millis(ttl));

        let mut conn = self.connection();
        let _: i64 = self
            .run("set_indexed", async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        Ok(())
    }

    async fn index_add(&self, index_key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.connection();
        let _: i64 = self
            .run("index_add", async move {
                redis::cmd("SADD")
                    .arg(index_key)
                    .arg(member)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(())
    }

    async fn index_members(&self, index_key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection();
        self.run("index_members", async move {
            redis::cmd("SMEMBERS")
                .arg(index_key)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(index = %index_key))]
    async fn delete_indexed(&self, index_key: &str) -> StoreResult<u64> {
        let mut invocation = self.scripts.delete_indexed.prepare_invoke();
        invocation.key(index_key);

        let mut conn = self.connection();
        self.run("delete_indexed", async move {
            invocation.invoke_async(&mut conn).await
        })
        .await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connection();
        let reply: Option<String> = self
            .run("set_if_absent", async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(duration_millis(ttl))
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut invocation = self.scripts.compare_and_delete.prepare_invoke();
        invocation.key(key).arg(expected);

        let mut conn = self.connection();
        let deleted: i64 = self
            .run("compare_and_delete", async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        Ok(deleted == 1)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut invocation = self.scripts.compare_and_expire.prepare_invoke();
        invocation.key(key).arg(expected).arg(duration_millis(ttl));

        let mut conn = self.connection();
        let extended: i64 = self
            .run("compare_and_expire", async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        Ok(extended == 1)
    }

    #[tracing::instrument(skip(self, key, policy, outcome), fields(store_key = %key, outcome = outcome.as_str()))]
    async fn breaker_transition(
        &self,
        key: &str,
        outcome: CallOutcome,
        policy: &BreakerPolicy,
        now_ms: u64,
    ) -> StoreResult<BreakerDecision> {
        let mut invocation = self.scripts.breaker_transition.prepare_invoke();
        invocation
            .key(key)
            .arg(outcome.as_str())
            .arg(policy.failure_threshold)
            .arg(policy.recovery_timeout_ms)
            .arg(now_ms);

        let mut conn = self.connection();
        let (allowed, state, event, failures): (i64, String, String, i64) = self
            .run("breaker_transition", async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        Ok(BreakerDecision {
            can_execute: allowed == 1,
            state: state.parse::<CircuitState>().map_err(StoreError::Protocol)?,
            transition: Transition::parse_event(&event).map_err(StoreError::Protocol)?,
            failure_count: failures.max(0) as u32,
        })
    }

    async fn breaker_snapshot(&self, key: &str) -> StoreResult<BreakerRecord> {
        let mut conn = self.connection();
        let (state, failures, opened_at): (Option<String>, Option<u32>, Option<u64>) = self
            .run("breaker_snapshot", async move {
                redis::cmd("HMGET")
                    .arg(key)
                    .arg("state")
                    .arg("failures")
                    .arg("opened_at")
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(BreakerRecord {
            state: match state {
                Some(state) => state.parse().map_err(StoreError::Protocol)?,
                None => CircuitState::Closed,
            },
            failure_count: failures.unwrap_or(0),
            opened_at_ms: opened_at.unwrap_or(0),
        })
    }

    #[tracing::instrument(skip(self, algorithm, rules), fields(algorithm = %algorithm, dimensions = rules.len()))]
    async fn rate_limit(
        &self,
        algorithm: RateAlgorithm,
        rules: &[RateRule],
        now_ms: u64,
    ) -> StoreResult<RateVerdict> {
        let mut invocation = self.scripts.rate_limit.prepare_invoke();
        for rule in rules {
            if algorithm == RateAlgorithm::TokenBucket {
                invocation.key(&rule.key);
            } else {
                let (current, previous) = rule.window_keys(now_ms);
                invocation.key(current).key(previous);
            }
        }
        invocation
            .arg(algorithm.as_str())
            .arg(now_ms)
            .arg(rules.len());
        for rule in rules {
            invocation
                .arg(rule.limit)
                .arg(rule.window_ms.max(1))
                .arg(rule.burst);
        }

        let mut conn = self.connection();
        let (allowed, limited_by, remaining, retry): (i64, i64, i64, i64) = self
            .run("rate_limit", async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        Ok(RateVerdict {
            allowed: allowed == 1,
            limited_by: (limited_by > 0).then(|| (limited_by - 1) as usize),
            remaining: remaining.max(0) as u64,
            retry_after_ms: retry.max(0) as u64,
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
        let mut invocation = self.scripts.bulkhead_acquire.prepare_invoke();
        invocation
            .key(key)
            .key(bulkhead_leases_key(key))
            .arg(max_concurrency)
            .arg(duration_millis(lease))
            .arg(now_ms)
            .arg(permit);

        let mut conn = self.connection();
        let (admitted, active, total): (i64, i64, i64) = self
            .run("bulkhead_acquire", async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        Ok(BulkheadAdmission {
            admitted: admitted == 1,
            active_calls: active.max(0) as u64,
            total_calls: total.max(0) as u64,
        })
    }

    async fn bulkhead_release(&self, key: &str, permit: &str, now_ms: u64) -> StoreResult<u64> {
        let mut invocation = self.scripts.bulkhead_release.prepare_invoke();
        invocation
            .key(bulkhead_leases_key(key))
            .arg(permit)
            .arg(now_ms);

        let mut conn = self.connection();
        let active: i64 = self
            .run("bulkhead_release", async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        Ok(active.max(0) as u64)
    }

    async fn bulkhead_snapshot(&self, key: &str, now_ms: u64) -> StoreResult<BulkheadRecord> {
        let mut pipe = redis::pipe();
        pipe.cmd("ZCOUNT")
            .arg(bulkhead_leases_key(key))
            .arg(format!("({}", now_ms))
            .arg("+inf")
            .cmd("HGET")
            .arg(key)
            .arg("total");

        let mut conn = self.connection();
        let (active, total): (u64, Option<u64>) = self
            .run("bulkhead_snapshot", async move { pipe.query_async(&mut conn).await })
            .await?;

        Ok(BulkheadRecord {
            active_calls: active,
            total_calls: total.unwrap_or(0),
        })
    }
}
