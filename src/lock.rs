//! Distributed lock with lease renewal
//!
//! A lock is a key holding a random owner token with a lease (PX expiry).
//! Acquisition is SET NX with bounded retries; release and renewal compare
//! the token first, so a process whose lease already expired can neither
//! delete nor extend a lock someone else now owns.
//!
//! # Example
//!
//! ```rust,no_run
//! use lighter_permission_cache::lock::{DistributedLock, LockOptions};
//! use lighter_permission_cache::store::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let lock = DistributedLock::new(store, "pc:lock:{report}", LockOptions::default());
//!
//! let rows = lock.with_lock(async { 42 }).await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::CacheConfig;
use crate::store::SharedStore;

/// Lock acquisition failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("lock {key} not acquired within the retry budget")]
    NotAcquired { key: String },
}

/// Lease and retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Lease length
    pub ttl: Duration,
    /// Extra attempts after the first one
    pub retry_count: u32,
    pub retry_interval: Duration,
    /// Extend the lease this often while held; `None` disables renewal
    pub renew_interval: Option<Duration>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            retry_count: 3,
            retry_interval: Duration::from_millis(50),
            renew_interval: None,
        }
    }
}

impl LockOptions {
    pub fn with_renewal(mut self, every: Duration) -> Self {
        self.renew_interval = Some(every);
        self
    }
}

impl From<&CacheConfig> for LockOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            ttl: config.lock_ttl(),
            retry_count: config.lock_retry_count,
            retry_interval: config.lock_retry_interval(),
            renew_interval: None,
        }
    }
}

struct Renewal {
    stop: watch::Sender<()>,
    handle: JoinHandle<()>,
}

struct Held {
    token: String,
    renewal: Option<Renewal>,
    lost: Arc<AtomicBool>,
}

/// Cross-process mutual exclusion on one key
pub struct DistributedLock {
    store: SharedStore,
    key: String,
    options: LockOptions,
    held: Mutex<Option<Held>>,
}

impl DistributedLock {
    pub fn new(store: SharedStore, key: impl Into<String>, options: LockOptions) -> Self {
        Self {
            store,
            key: key.into(),
            options,
            held: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Token of the current acquisition, if held
    pub fn owner_token(&self) -> Option<String> {
        self.state().as_ref().map(|held| held.token.clone())
    }

    /// Whether this handle believes it holds the lock.
    ///
    /// Turns false when renewal finds the key owned by someone else.
    pub fn is_held(&self) -> bool {
        self.state()
            .as_ref()
            .is_some_and(|held| !held.lost.load(Ordering::SeqCst))
    }

    fn state(&self) -> MutexGuard<'_, Option<Held>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to take the lock, retrying up to `retry_count` times.
    ///
    /// Returns `false` on contention or when the store cannot be reached.
    #[tracing::instrument(skip(self), fields(lock = %self.key))]
    pub async fn acquire(&self) -> bool {
        if self.is_held() {
            return true;
        }

        let token = new_token();
        for attempt in 0..=self.options.retry_count {
            match self
                .store
                .set_if_absent(&self.key, &token, self.options.ttl)
                .await
            {
                Ok(true) => {
                    tracing::debug!(attempt, "Lock acquired");
                    let lost = Arc::new(AtomicBool::new(false));
                    let renewal = self
                        .options
                        .renew_interval
                        .map(|every| self.spawn_renewal(token.clone(), every, lost.clone()));
                    *self.state() = Some(Held {
                        token,
                        renewal,
                        lost,
                    });
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Lock acquisition failed, store unavailable");
                    return false;
                }
            }

            if attempt < self.options.retry_count {
                tokio::time::sleep(self.options.retry_interval).await;
            }
        }

        tracing::debug!(
            retries = self.options.retry_count,
            "Lock contended, retry budget exhausted"
        );
        false
    }

    /// Release the lock if this handle still owns it.
    ///
    /// Renewal is stopped and joined before the delete, so a released lock
    /// is never extended again. Returns whether the key was deleted.
    #[tracing::instrument(skip(self), fields(lock = %self.key))]
    pub async fn release(&self) -> bool {
        let Some(held) = self.state().take() else {
            return false;
        };

        if let Some(renewal) = held.renewal {
            let _ = renewal.stop.send(());
            if let Err(e) = renewal.handle.await {
                tracing::warn!(error = %e, "Lock renewal task ended abnormally");
            }
        }

        match self.store.compare_and_delete(&self.key, &held.token).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!("Lock lease expired before release, key owned by someone else");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Lock release failed, lease will expire");
                false
            }
        }
    }

    /// Acquire, returning a guard that releases when dropped
    pub async fn guard(&self) -> Result<LockGuard<'_>, LockError> {
        if self.acquire().await {
            Ok(LockGuard {
                lock: self,
                released: false,
            })
        } else {
            Err(LockError::NotAcquired {
                key: self.key.clone(),
            })
        }
    }

    /// Run `fut` while holding the lock; the lock is released on every exit
    /// path, including cancellation and panics
    pub async fn with_lock<Fut, T>(&self, fut: Fut) -> Result<T, LockError>
    where
        Fut: Future<Output = T>,
    {
        let guard = self.guard().await?;
        let output = fut.await;
        guard.release().await;
        Ok(output)
    }

    fn spawn_renewal(&self, token: String, every: Duration, lost: Arc<AtomicBool>) -> Renewal {
        let (stop, mut stop_rx) = watch::channel(());
        let store = self.store.clone();
        let key = self.key.clone();
        let ttl = self.options.ttl;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(every) => {
                        match store.compare_and_expire(&key, &token, ttl).await {
                            Ok(true) => tracing::trace!(lock = %key, "Lock lease renewed"),
                            Ok(false) => {
                                tracing::warn!(lock = %key, "Lock ownership lost, renewal stopped");
                                lost.store(true, Ordering::SeqCst);
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(lock = %key, error = %e, "Lock renewal failed, retrying");
                            }
                        }
                    }
                }
            }
        });

        Renewal { stop, handle }
    }

    /// Drop-path release: stop renewal now, delete in a spawned task
    fn release_in_background(&self) {
        let Some(held) = self.state().take() else {
            return;
        };
        if let Some(renewal) = held.renewal {
            renewal.handle.abort();
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let store = self.store.clone();
                let key = self.key.clone();
                runtime.spawn(async move {
                    if let Err(e) = store.compare_and_delete(&key, &held.token).await {
                        tracing::warn!(lock = %key, error = %e, "Background lock release failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(lock = %self.key, "No runtime to release lock, lease will expire");
            }
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        self.release_in_background();
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("options", &self.options)
            .field("held", &self.is_held())
            .finish()
    }
}

/// Scoped ownership of a [`DistributedLock`]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a DistributedLock,
    released: bool,
}

impl LockGuard<'_> {
    pub fn key(&self) -> &str {
        self.lock.key()
    }

    pub async fn release(mut self) -> bool {
        self.released = true;
        self.lock.release().await
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.lock.release_in_background();
        }
    }
}

fn new_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}
