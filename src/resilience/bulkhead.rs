//! Distributed bulkhead
//!
//! Caps how many calls run at once across every process sharing the name.
//! Every admitted call holds its own lease of `lease_ms`. A slot leaked by a
//! crashed process is reclaimed when its lease ends, whatever the traffic.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::ResilienceContext;
use super::state::BulkheadRecord;
use crate::store::{StoreResult, bulkhead_leases_key};

#[derive(Debug, thiserror::Error)]
pub enum BulkheadError {
    #[error("Bulkhead {name} is full ({max_concurrency} concurrent calls)")]
    Full { name: String, max_concurrency: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PermitMode {
    /// Lease held in the distributed store under this permit id
    Distributed(String),
    /// Slot taken on the per-process counter while the store was down
    Local,
}

/// Named, distributed concurrency limit
pub struct Bulkhead {
    name: String,
    state_key: String,
    context: ResilienceContext,
    /// Calls admitted against the local counter during a store outage
    local_active: Arc<AtomicU64>,
    rejected: AtomicU64,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, context: ResilienceContext) -> Self {
        let name = name.into();
        Self {
            state_key: context.keys.bulkhead(&name),
            name,
            context,
            local_active: Arc::new(AtomicU64::new(0)),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rejected_calls(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Calls holding a local slot
    pub fn local_active(&self) -> u64 {
        self.local_active.load(Ordering::Relaxed)
    }

    /// Take a slot, or `None` when the bulkhead is full
    #[tracing::instrument(skip(self), fields(bulkhead = %self.name))]
    pub async fn try_acquire(&self) -> Option<BulkheadPermit<'_>> {
        let config = self.context.configs.bulkhead(&self.name).await;
        let permit = format!("{:032x}", rand::random::<u128>());

        let mode = match self
            .context
            .store
            .bulkhead_acquire(
                &self.state_key,
                &permit,
                config.max_concurrency,
                config.lease(),
                self.context.now_millis(),
            )
            .await
        {
            Ok(admission) if admission.admitted => Some(PermitMode::Distributed(permit)),
            Ok(admission) => {
                tracing::debug!(active_calls = admission.active_calls, "Bulkhead full");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Bulkhead store unavailable, using local counter");
                let max = config.max_concurrency;
                self.local_active
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                        (active < max).then_some(active + 1)
                    })
                    .ok()
                    .map(|_| PermitMode::Local)
            }
        };

        match mode {
            Some(mode) => Some(BulkheadPermit {
                bulkhead: self,
                mode,
                released: false,
            }),
            None => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                self.context.monitor.record_event(
                    "bulkhead_rejected",
                    &[
                        ("bulkhead", self.name.clone()),
                        ("max_concurrency", config.max_concurrency.to_string()),
                    ],
                );
                None
            }
        }
    }

    /// Run `fut` inside a slot, released on every exit path
    pub async fn run<F, T>(&self, fut: F) -> Result<T, BulkheadError>
    where
        F: Future<Output = T>,
    {
        let Some(permit) = self.try_acquire().await else {
            let config = self.context.configs.bulkhead(&self.name).await;
            return Err(BulkheadError::Full {
                name: self.name.clone(),
                max_concurrency: config.max_concurrency,
            });
        };

        let output = fut.await;
        permit.release().await;
        Ok(output)
    }

    pub async fn snapshot(&self) -> StoreResult<BulkheadRecord> {
        self.context
            .store
            .bulkhead_snapshot(&self.state_key, self.context.now_millis())
            .await
    }

    /// Drop the shared counters, freeing every slot
    pub async fn reset(&self) -> StoreResult<()> {
        self.context
            .store
            .delete(&[self.state_key.clone(), bulkhead_leases_key(&self.state_key)])
            .await?;
        self.local_active.store(0, Ordering::Relaxed);
        tracing::info!(bulkhead = %self.name, "Bulkhead reset");
        Ok(())
    }

    async fn release_slot(&self, mode: &PermitMode) {
        match mode {
            PermitMode::Distributed(permit) => {
                if let Err(e) = self
                    .context
                    .store
                    .bulkhead_release(&self.state_key, permit, self.context.now_millis())
                    .await
                {
                    tracing::warn!(
                        bulkhead = %self.name,
                        error = %e,
                        "Bulkhead release failed, slot expires with the lease"
                    );
                }
            }
            PermitMode::Local => release_local(&self.local_active),
        }
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("state_key", &self.state_key)
            .field("local_active", &self.local_active())
            .field("rejected", &self.rejected_calls())
            .finish()
    }
}

fn release_local(active: &AtomicU64) {
    let _ = active.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

/// One admitted call
///
/// Prefer [`BulkheadPermit::release`]; dropping the permit releases the slot
/// from a spawned task.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct BulkheadPermit<'a> {
    bulkhead: &'a Bulkhead,
    mode: PermitMode,
    released: bool,
}

impl BulkheadPermit<'_> {
    pub fn is_local(&self) -> bool {
        self.mode == PermitMode::Local
    }

    pub async fn release(mut self) {
        self.released = true;
        self.bulkhead.release_slot(&self.mode).await;
    }
}

impl fmt::Debug for BulkheadPermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadPermit")
            .field("bulkhead", &self.bulkhead.name)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for BulkheadPermit<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match &self.mode {
            PermitMode::Local => release_local(&self.bulkhead.local_active),
            PermitMode::Distributed(permit) => {
                let store = self.bulkhead.context.store.clone();
                let key = self.bulkhead.state_key.clone();
                let permit = permit.clone();
                let now_ms = self.bulkhead.context.now_millis();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            if let Err(e) = store.bulkhead_release(&key, &permit, now_ms).await {
                                tracing::warn!(key = %key, error = %e, "Bulkhead release failed");
                            }
                        });
                    }
                    Err(_) => tracing::warn!(
                        key = %key,
                        "Bulkhead permit dropped outside a runtime, slot expires with the lease"
                    ),
                }
            }
        }
    }
}
