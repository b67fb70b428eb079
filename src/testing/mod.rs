//! Test doubles for the collaborator contracts

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::cache::PermissionSet;
use crate::collaborators::{Monitor, PermissionSource};
use crate::keys::Scope;

/// One event or metric sample as received
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub name: String,
    pub value: Option<f64>,
    pub labels: HashMap<String, String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn labels(pairs: &[(&str, String)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

/// Monitor keeping everything it receives
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    events: Mutex<Vec<Recorded>>,
    metrics: Mutex<Vec<Recorded>>,
}

impl RecordingMonitor {
    pub fn events(&self) -> Vec<Recorded> {
        lock(&self.events).clone()
    }

    /// Metadata of every event called `name`, in arrival order
    pub fn events_named(&self, name: &str) -> Vec<HashMap<String, String>> {
        lock(&self.events)
            .iter()
            .filter(|event| event.name == name)
            .map(|event| event.labels.clone())
            .collect()
    }

    /// Values of every sample of metric `name`, in arrival order
    pub fn metric_values(&self, name: &str) -> Vec<f64> {
        lock(&self.metrics)
            .iter()
            .filter(|sample| sample.name == name)
            .filter_map(|sample| sample.value)
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
        lock(&self.metrics).clear();
    }
}

impl Monitor for RecordingMonitor {
    fn record_event(&self, name: &str, metadata: &[(&str, String)]) {
        lock(&self.events).push(Recorded {
            name: name.to_string(),
            value: None,
            labels: labels(metadata),
        });
    }

    fn record_metric(&self, name: &str, value: f64, tags: &[(&str, String)]) {
        lock(&self.metrics).push(Recorded {
            name: name.to_string(),
            value: Some(value),
            labels: labels(tags),
        });
    }
}

/// Permission source backed by fixed maps
///
/// Subjects without configured permissions compute to an empty set.
#[derive(Debug, Default)]
pub struct StaticPermissionSource {
    permissions: HashMap<String, PermissionSet>,
    roles: HashMap<String, Vec<String>>,
    compute_calls: AtomicU64,
}

impl StaticPermissionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_permissions<I, S>(mut self, subject_id: &str, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions
            .insert(subject_id.to_string(), permissions.into_iter().collect());
        self
    }

    pub fn with_role<I, S>(mut self, role_id: &str, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.insert(
            role_id.to_string(),
            subjects.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// How many single-subject computations ran
    pub fn compute_calls(&self) -> u64 {
        self.compute_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionSource for StaticPermissionSource {
    async fn compute_permissions(
        &self,
        subject_id: &str,
        _scope: &Scope,
    ) -> anyhow::Result<PermissionSet> {
        self.compute_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.permissions.get(subject_id).cloned().unwrap_or_default())
    }

    async fn subjects_with_role(&self, role_id: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.roles.get(role_id).cloned().unwrap_or_default())
    }
}
