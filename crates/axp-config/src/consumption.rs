//! Typed consumption of the recognized execution configuration keys.
//!
//! Anything not listed in [`CONSUMED_POINTERS`] is ignored by the executor;
//! boot logging can diff the loaded document against this list to flag
//! unused keys.

use serde_json::Value;
use std::collections::BTreeMap;

/// JSON-pointer roots the executor reads.
pub static CONSUMED_POINTERS: &[&str] = &[
    "/execution/orchestration_timeout_hours",
    "/execution/attempt_ttl_buffer_seconds",
    "/retention/outcome_days",
    "/retention/dedupe_days",
    "/resilience/slo_sample_rate",
    "/resilience/breaker", // subtree: failure_threshold, window_seconds, cooldown_seconds
    "/resilience/concurrency", // subtree: default_capacity, default_retry_after_seconds, per_connector
];

fn cfg_f64(v: &Value, ptr: &str, default: f64) -> f64 {
    v.pointer(ptr).and_then(Value::as_f64).unwrap_or(default)
}

fn cfg_i64(v: &Value, ptr: &str, default: i64) -> i64 {
    v.pointer(ptr).and_then(Value::as_i64).unwrap_or(default)
}

/// Execution configuration with every recognized option at its default.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Orchestration timeout, in hours. The attempt TTL is derived from it.
    pub orchestration_timeout_hours: i64,
    /// Buffer added on top of the orchestration timeout for the attempt TTL.
    pub attempt_ttl_buffer_seconds: i64,
    /// Outcome retention, in days.
    pub outcome_retention_days: i64,
    /// Adapter-layer dedupe retention, in days.
    pub dedupe_retention_days: i64,
    /// Fraction of successful tool calls that carry the tenant dimension.
    pub slo_sample_rate: f64,
    /// Failures within the window that trip the breaker to OPEN.
    pub breaker_failure_threshold: i64,
    /// Failure-counting window, in seconds.
    pub breaker_window_seconds: i64,
    /// OPEN cooldown before a HALF_OPEN probe is admitted, in seconds.
    pub breaker_cooldown_seconds: i64,
    /// Concurrency capacity when a connector has no explicit entry.
    pub concurrency_default_capacity: i64,
    /// Retry hint returned on backpressure deferral, in seconds.
    pub concurrency_retry_after_seconds: i64,
    /// Per-connector capacity overrides.
    pub concurrency_per_connector: BTreeMap<String, i64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            orchestration_timeout_hours: 1,
            attempt_ttl_buffer_seconds: 900,
            outcome_retention_days: 90,
            dedupe_retention_days: 7,
            slo_sample_rate: 0.01,
            breaker_failure_threshold: 5,
            breaker_window_seconds: 60,
            breaker_cooldown_seconds: 30,
            concurrency_default_capacity: 8,
            concurrency_retry_after_seconds: 30,
            concurrency_per_connector: BTreeMap::new(),
        }
    }
}

impl ExecutionConfig {
    /// Read the recognized keys from a loaded config document; anything
    /// absent falls back to its default.
    pub fn consume(cfg: &Value) -> Self {
        let d = Self::default();

        let mut per_connector = BTreeMap::new();
        if let Some(map) = cfg
            .pointer("/resilience/concurrency/per_connector")
            .and_then(Value::as_object)
        {
            for (k, v) in map {
                if let Some(n) = v.as_i64() {
                    per_connector.insert(k.clone(), n);
                }
            }
        }

        Self {
            orchestration_timeout_hours: cfg_i64(
                cfg,
                "/execution/orchestration_timeout_hours",
                d.orchestration_timeout_hours,
            ),
            attempt_ttl_buffer_seconds: cfg_i64(
                cfg,
                "/execution/attempt_ttl_buffer_seconds",
                d.attempt_ttl_buffer_seconds,
            ),
            outcome_retention_days: cfg_i64(cfg, "/retention/outcome_days", d.outcome_retention_days),
            dedupe_retention_days: cfg_i64(cfg, "/retention/dedupe_days", d.dedupe_retention_days),
            slo_sample_rate: cfg_f64(cfg, "/resilience/slo_sample_rate", d.slo_sample_rate),
            breaker_failure_threshold: cfg_i64(
                cfg,
                "/resilience/breaker/failure_threshold",
                d.breaker_failure_threshold,
            ),
            breaker_window_seconds: cfg_i64(
                cfg,
                "/resilience/breaker/window_seconds",
                d.breaker_window_seconds,
            ),
            breaker_cooldown_seconds: cfg_i64(
                cfg,
                "/resilience/breaker/cooldown_seconds",
                d.breaker_cooldown_seconds,
            ),
            concurrency_default_capacity: cfg_i64(
                cfg,
                "/resilience/concurrency/default_capacity",
                d.concurrency_default_capacity,
            ),
            concurrency_retry_after_seconds: cfg_i64(
                cfg,
                "/resilience/concurrency/default_retry_after_seconds",
                d.concurrency_retry_after_seconds,
            ),
            concurrency_per_connector: per_connector,
        }
    }

    /// Orchestration timeout in seconds.
    pub fn orchestration_timeout_seconds(&self) -> i64 {
        self.orchestration_timeout_hours * 3600
    }
}
