//! Resilience wrapper around every tool-gateway call: circuit breaker,
//! per-connector backpressure, and SLO metrics.
//!
//! The wrapper's ordering is fixed: breaker admission → concurrency token →
//! run → record + emit → release. Open-circuit behavior depends on the call
//! type: execution calls fail fast, perception calls defer with a retry
//! hint.

mod breaker;
mod concurrency;
mod invoker;
mod metrics;

pub use breaker::{Admission, BreakerConfig, BreakerPhase, CircuitBreaker};
pub use concurrency::ConcurrencyLimiter;
pub use invoker::{InvokeError, Invoked, ResilientInvoker};
pub use metrics::{
    Metric, MetricsSink, RecordingMetricsSink, TracingMetricsSink, METRIC_TOOL_ERROR,
    METRIC_TOOL_LATENCY_MS, METRIC_TOOL_SUCCESS,
};

/// Open-circuit behavior tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    /// Side-effecting execution: an open circuit is a fatal step failure.
    Phase4Execution,
    /// Perception/read paths: an open circuit defers with a retry hint.
    Phase5Perception,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Phase4Execution => "phase4_execution",
            CallType::Phase5Perception => "phase5_perception",
        }
    }
}

/// Map a tool name onto its connector: the first dotted segment, with the
/// well-known connectors normalized. Empty and leading-dot names collapse
/// to `unknown`.
pub fn connector_id(tool_name: &str) -> String {
    let first = tool_name.split('.').next().unwrap_or("");
    match first {
        "" => "unknown".to_string(),
        "internal" => "internal".to_string(),
        "crm" => "crm_salesforce".to_string(),
        "calendar" => "calendar".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_derivation_table() {
        assert_eq!(connector_id("internal.create_task"), "internal");
        assert_eq!(connector_id("crm.create_task"), "crm_salesforce");
        assert_eq!(connector_id("calendar.create_event"), "calendar");
        assert_eq!(connector_id("billing.charge"), "billing");
        assert_eq!(connector_id(""), "unknown");
        assert_eq!(connector_id(".hidden"), "unknown");
        assert_eq!(connector_id("solo"), "solo");
    }

    #[test]
    fn call_type_tags_are_wire_stable() {
        assert_eq!(CallType::Phase4Execution.as_str(), "phase4_execution");
        assert_eq!(CallType::Phase5Perception.as_str(), "phase5_perception");
    }
}
