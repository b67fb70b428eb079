//! `metrics` facade backed monitor
//!
//! Events become a counter labelled by event name; metric samples become a
//! histogram per name, labelled by their tags. Whatever recorder the host
//! application installs (Prometheus, StatsD, ...) receives them.

use metrics::{Label, counter, describe_counter, describe_histogram, histogram};
use std::sync::Once;

use crate::collaborators::Monitor;

static DESCRIBE: Once = Once::new();

pub const EVENTS_TOTAL: &str = "permission_cache_events_total";
pub const METRIC_PREFIX: &str = "permission_cache_";

/// Monitor forwarding to the global `metrics` recorder
#[derive(Debug, Clone)]
pub struct MetricsMonitor {
    /// Metadata keys copied onto the event counter as labels
    event_labels: Vec<&'static str>,
}

impl MetricsMonitor {
    pub fn new() -> Self {
        DESCRIBE.call_once(Self::describe_metrics);
        Self {
            event_labels: vec![
                "breaker",
                "limiter",
                "bulkhead",
                "transition",
                "dimension",
                "level",
                "reason",
            ],
        }
    }

    /// Restrict which metadata keys become counter labels
    pub fn with_event_labels(mut self, labels: Vec<&'static str>) -> Self {
        self.event_labels = labels;
        self
    }

    fn describe_metrics() {
        describe_counter!(EVENTS_TOTAL, "Facts emitted by the permission cache");
        describe_histogram!(
            "permission_cache_invalidation_batch_size",
            "Operations applied per invalidation batch"
        );
        describe_histogram!(
            "permission_cache_invalidation_queue_size",
            "Delayed invalidation queue length at each drain"
        );
    }
}

impl Default for MetricsMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for MetricsMonitor {
    fn record_event(&self, name: &str, metadata: &[(&str, String)]) {
        let mut labels = vec![Label::new("event", name.to_string())];
        labels.extend(
            metadata
                .iter()
                .filter(|(key, _)| self.event_labels.iter().any(|label| label == key))
                .map(|(key, value)| Label::new(key.to_string(), value.clone())),
        );
        counter!(EVENTS_TOTAL, labels).increment(1);

        tracing::debug!(event = name, metadata = ?metadata, "Monitor event");
    }

    fn record_metric(&self, name: &str, value: f64, tags: &[(&str, String)]) {
        let labels: Vec<Label> = tags
            .iter()
            .map(|(key, value)| Label::new(key.to_string(), value.clone()))
            .collect();
        histogram!(format!("{}{}", METRIC_PREFIX, name), labels).record(value);
    }
}
