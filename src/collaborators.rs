//! Contracts for the systems this crate wraps but does not implement
//!
//! - [`PermissionSource`] computes permission sets from the relational layer.
//! - [`Monitor`] receives facts (events and metric samples). It is
//!   fire-and-forget: implementations must not block and cannot fail the
//!   caller.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::cache::PermissionSet;
use crate::keys::Scope;

/// Query collaborator computing permissions from the source of truth
#[async_trait]
pub trait PermissionSource: Send + Sync {
    async fn compute_permissions(
        &self,
        subject_id: &str,
        scope: &Scope,
    ) -> anyhow::Result<PermissionSet>;

    /// Batch form; the default computes one subject at a time
    async fn compute_permissions_batch(
        &self,
        subject_ids: &[String],
        scope: &Scope,
    ) -> anyhow::Result<HashMap<String, PermissionSet>> {
        let mut computed = HashMap::with_capacity(subject_ids.len());
        for subject_id in subject_ids {
            let permissions = self.compute_permissions(subject_id, scope).await?;
            computed.insert(subject_id.clone(), permissions);
        }
        Ok(computed)
    }

    /// Subjects currently holding `role_id`
    async fn subjects_with_role(&self, role_id: &str) -> anyhow::Result<Vec<String>>;
}

/// Monitoring collaborator
pub trait Monitor: Send + Sync + Debug {
    fn record_event(&self, name: &str, metadata: &[(&str, String)]);

    fn record_metric(&self, name: &str, value: f64, tags: &[(&str, String)]);
}

pub type SharedMonitor = Arc<dyn Monitor>;

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMonitor;

impl Monitor for NullMonitor {
    fn record_event(&self, _name: &str, _metadata: &[(&str, String)]) {}

    fn record_metric(&self, _name: &str, _value: f64, _tags: &[(&str, String)]) {}
}

pub fn null_monitor() -> SharedMonitor {
    Arc::new(NullMonitor)
}
