//! SLO metrics sink.
//!
//! Every wrapped call emits a latency metric and a success or error count.
//! Emission is strictly best-effort: a sink failure is logged and never
//! propagates into the call path.

use std::sync::Mutex;

use tracing::info;

pub const METRIC_TOOL_LATENCY_MS: &str = "tool_latency_ms";
pub const METRIC_TOOL_SUCCESS: &str = "tool_success";
pub const METRIC_TOOL_ERROR: &str = "tool_error";

/// One metric emission.
#[derive(Debug, Clone)]
pub struct Metric {
    pub name: &'static str,
    pub value: f64,
    /// `(dimension, value)` pairs; always includes `tool_name` and
    /// `connector_id`, plus `tenant_id` per the sampling policy.
    pub dimensions: Vec<(String, String)>,
}

pub trait MetricsSink: Send + Sync {
    fn emit(&self, metric: Metric) -> anyhow::Result<()>;
}

/// Production sink: structured `tracing` events on a dedicated target, in
/// the shape the downstream metrics shipper scrapes.
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn emit(&self, metric: Metric) -> anyhow::Result<()> {
        let dims = metric
            .dimensions
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        info!(
            target: "axp::metrics",
            metric = metric.name,
            value = metric.value,
            dimensions = %dims,
        );
        Ok(())
    }
}

/// Test sink: records every emission for assertions.
#[derive(Default)]
pub struct RecordingMetricsSink {
    emitted: Mutex<Vec<Metric>>,
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Metric> {
        self.emitted.lock().expect("metrics mutex poisoned").clone()
    }

    pub fn count_named(&self, name: &str) -> usize {
        self.snapshot().iter().filter(|m| m.name == name).count()
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn emit(&self, metric: Metric) -> anyhow::Result<()> {
        self.emitted
            .lock()
            .expect("metrics mutex poisoned")
            .push(metric);
        Ok(())
    }
}
