//! The uniform invoke wrapper.
//!
//! Ordering is mandatory and fixed:
//!
//! 1. Breaker admission. Denied: execution calls throw `CircuitOpen`,
//!    perception calls return a deferral.
//! 2. Concurrency token. Over-limit: deferral with the retry hint.
//! 3. Run the call with a latency measurement.
//! 4. Record success/failure on the breaker, emit metrics, release the
//!    token (RAII permit), return or rethrow.
//!
//! Breaker bookkeeping and metric emission are best-effort on the success
//! path: a successful tool call is never failed retroactively by
//! observability plumbing.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use axp_store::{KvStore, StoreError};

use crate::{
    breaker::{Admission, CircuitBreaker},
    concurrency::ConcurrencyLimiter,
    connector_id,
    metrics::{Metric, MetricsSink, METRIC_TOOL_ERROR, METRIC_TOOL_LATENCY_MS, METRIC_TOOL_SUCCESS},
    CallType,
};

/// Non-error outcome of a wrapped call.
#[derive(Debug)]
pub enum Invoked<T> {
    Success(T),
    /// Backpressure or open-circuit deferral; the runtime re-enqueues
    /// after the hint.
    Deferred { retry_after_seconds: i64 },
}

#[derive(Debug, Error)]
pub enum InvokeError {
    /// Open circuit on an execution call: fatal for the step.
    #[error("circuit breaker open for connector {connector_id}; retry after {retry_after_seconds}s")]
    CircuitOpen {
        connector_id: String,
        retry_after_seconds: i64,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The tool call itself failed; rethrown unchanged.
    #[error(transparent)]
    Tool(anyhow::Error),
}

pub struct ResilientInvoker<S: KvStore> {
    breaker: CircuitBreaker<S>,
    limiter: ConcurrencyLimiter,
    metrics: Arc<dyn MetricsSink>,
    /// Every Nth success carries the tenant dimension (cost control);
    /// errors always carry it.
    success_sample_every: u64,
    success_counter: AtomicU64,
}

impl<S: KvStore> ResilientInvoker<S> {
    pub fn new(
        breaker: CircuitBreaker<S>,
        limiter: ConcurrencyLimiter,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            breaker,
            limiter,
            metrics,
            success_sample_every: 100,
            success_counter: AtomicU64::new(0),
        }
    }

    /// Set the success-sample rate (default 0.01 → every 100th success).
    pub fn with_slo_sample_rate(mut self, rate: f64) -> Self {
        self.success_sample_every = if rate <= 0.0 {
            u64::MAX
        } else {
            (1.0 / rate).round().max(1.0) as u64
        };
        self
    }

    pub async fn invoke<T, F, Fut>(
        &self,
        tool_name: &str,
        tenant_id: Option<&str>,
        call_type: CallType,
        f: F,
    ) -> Result<Invoked<T>, InvokeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let connector = connector_id(tool_name);
        let now = Utc::now().timestamp();

        match self.breaker.allow_request(&connector, now).await? {
            Admission::Allowed => {}
            Admission::Denied { retry_after_seconds } => {
                return match call_type {
                    CallType::Phase4Execution => Err(InvokeError::CircuitOpen {
                        connector_id: connector,
                        retry_after_seconds,
                    }),
                    CallType::Phase5Perception => Ok(Invoked::Deferred {
                        retry_after_seconds,
                    }),
                };
            }
        }

        // RAII token: released on every path out of this function.
        let _permit = match self.limiter.try_acquire(&connector) {
            Some(p) => p,
            None => {
                return Ok(Invoked::Deferred {
                    retry_after_seconds: self.limiter.retry_after_seconds(),
                })
            }
        };

        let started = Instant::now();
        let result = f().await;
        let latency_ms = started.elapsed().as_millis() as f64;
        let finished = Utc::now().timestamp();

        match result {
            Ok(value) => {
                if let Err(e) = self.breaker.record_success(&connector, finished).await {
                    warn!(connector_id = %connector, error = %e, "breaker success record failed");
                }
                let with_tenant = self.sample_success();
                self.emit(tool_name, &connector, tenant_id, with_tenant, latency_ms, true);
                Ok(Invoked::Success(value))
            }
            Err(e) => {
                if let Err(be) = self.breaker.record_failure(&connector, finished).await {
                    warn!(connector_id = %connector, error = %be, "breaker failure record failed");
                }
                self.emit(tool_name, &connector, tenant_id, true, latency_ms, false);
                Err(InvokeError::Tool(e))
            }
        }
    }

    fn sample_success(&self) -> bool {
        if self.success_sample_every == u64::MAX {
            return false;
        }
        let n = self.success_counter.fetch_add(1, Ordering::Relaxed);
        n % self.success_sample_every == 0
    }

    fn emit(
        &self,
        tool_name: &str,
        connector: &str,
        tenant_id: Option<&str>,
        with_tenant: bool,
        latency_ms: f64,
        success: bool,
    ) {
        let mut dims = vec![
            ("tool_name".to_string(), tool_name.to_string()),
            ("connector_id".to_string(), connector.to_string()),
        ];
        if with_tenant {
            if let Some(tenant) = tenant_id {
                dims.push(("tenant_id".to_string(), tenant.to_string()));
            }
        }

        let counter = if success {
            METRIC_TOOL_SUCCESS
        } else {
            METRIC_TOOL_ERROR
        };

        for metric in [
            Metric {
                name: METRIC_TOOL_LATENCY_MS,
                value: latency_ms,
                dimensions: dims.clone(),
            },
            Metric {
                name: counter,
                value: 1.0,
                dimensions: dims.clone(),
            },
        ] {
            if let Err(e) = self.metrics.emit(metric) {
                warn!(tool_name, error = %e, "metric emission failed; continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BreakerConfig, RecordingMetricsSink};
    use axp_store::MemoryKvStore;
    use std::sync::atomic::AtomicBool;

    fn invoker_with(
        store: Arc<MemoryKvStore>,
        sink: Arc<RecordingMetricsSink>,
        capacity: usize,
    ) -> ResilientInvoker<Arc<MemoryKvStore>> {
        ResilientInvoker::new(
            CircuitBreaker::new(store, BreakerConfig::default()),
            ConcurrencyLimiter::new(capacity, 30),
            sink,
        )
    }

    async fn trip_breaker(store: &Arc<MemoryKvStore>, connector: &str) {
        let b = CircuitBreaker::new(store.clone(), BreakerConfig::default());
        let now = Utc::now().timestamp();
        for i in 0..5 {
            b.record_failure(connector, now + i).await.unwrap();
        }
    }

    #[tokio::test]
    async fn success_path_returns_value_and_emits_metrics() {
        let sink = Arc::new(RecordingMetricsSink::new());
        let invoker = invoker_with(Arc::new(MemoryKvStore::new()), sink.clone(), 4);

        let out = invoker
            .invoke("internal.create_task", Some("t1"), CallType::Phase4Execution, || async {
                Ok::<_, anyhow::Error>(42)
            })
            .await
            .unwrap();
        assert!(matches!(out, Invoked::Success(42)));

        assert_eq!(sink.count_named(METRIC_TOOL_LATENCY_MS), 1);
        assert_eq!(sink.count_named(METRIC_TOOL_SUCCESS), 1);
        let dims = &sink.snapshot()[0].dimensions;
        assert!(dims.contains(&("connector_id".to_string(), "internal".to_string())));
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_for_execution_calls() {
        let store = Arc::new(MemoryKvStore::new());
        trip_breaker(&store, "internal").await;
        let invoker = invoker_with(store, Arc::new(RecordingMetricsSink::new()), 4);

        let called = AtomicBool::new(false);
        let err = invoker
            .invoke("internal.create_task", Some("t1"), CallType::Phase4Execution, || {
                called.store(true, Ordering::SeqCst);
                async { Ok::<_, anyhow::Error>(()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, InvokeError::CircuitOpen { .. }));
        assert!(!called.load(Ordering::SeqCst), "fn must not run on open circuit");
    }

    #[tokio::test]
    async fn open_circuit_defers_perception_calls() {
        let store = Arc::new(MemoryKvStore::new());
        trip_breaker(&store, "internal").await;
        let invoker = invoker_with(store, Arc::new(RecordingMetricsSink::new()), 4);

        let called = AtomicBool::new(false);
        let out = invoker
            .invoke("internal.read_state", Some("t1"), CallType::Phase5Perception, || {
                called.store(true, Ordering::SeqCst);
                async { Ok::<_, anyhow::Error>(()) }
            })
            .await
            .unwrap();

        match out {
            Invoked::Deferred { retry_after_seconds } => {
                assert_eq!(retry_after_seconds, 30, "default cooldown is the hint");
            }
            Invoked::Success(_) => panic!("expected deferral"),
        }
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn over_capacity_defers_with_the_configured_hint() {
        let invoker = invoker_with(
            Arc::new(MemoryKvStore::new()),
            Arc::new(RecordingMetricsSink::new()),
            0,
        );

        let out = invoker
            .invoke("internal.create_task", None, CallType::Phase4Execution, || async {
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap();
        assert!(matches!(out, Invoked::Deferred { retry_after_seconds: 30 }));
    }

    #[tokio::test]
    async fn tool_failure_is_rethrown_and_counted() {
        let sink = Arc::new(RecordingMetricsSink::new());
        let invoker = invoker_with(Arc::new(MemoryKvStore::new()), sink.clone(), 4);

        let err = invoker
            .invoke("crm.create_task", Some("t1"), CallType::Phase4Execution, || async {
                Err::<(), _>(anyhow::anyhow!("gateway 502"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Tool(_)));
        assert!(err.to_string().contains("gateway 502"));

        assert_eq!(sink.count_named(METRIC_TOOL_ERROR), 1);
        // Errors always carry the tenant dimension.
        let error_metric = sink
            .snapshot()
            .into_iter()
            .find(|m| m.name == METRIC_TOOL_ERROR)
            .unwrap();
        assert!(error_metric
            .dimensions
            .contains(&("tenant_id".to_string(), "t1".to_string())));
    }

    #[tokio::test]
    async fn token_is_released_after_each_call() {
        let invoker = invoker_with(
            Arc::new(MemoryKvStore::new()),
            Arc::new(RecordingMetricsSink::new()),
            1,
        );

        for _ in 0..3 {
            let out = invoker
                .invoke("internal.create_task", None, CallType::Phase4Execution, || async {
                    Ok::<_, anyhow::Error>(())
                })
                .await
                .unwrap();
            assert!(matches!(out, Invoked::Success(())));
        }
    }

    #[tokio::test]
    async fn success_sampling_adds_tenant_on_first_of_every_hundred() {
        let sink = Arc::new(RecordingMetricsSink::new());
        let invoker = invoker_with(Arc::new(MemoryKvStore::new()), sink.clone(), 4)
            .with_slo_sample_rate(0.5);

        for _ in 0..2 {
            invoker
                .invoke("internal.create_task", Some("t1"), CallType::Phase4Execution, || async {
                    Ok::<_, anyhow::Error>(())
                })
                .await
                .unwrap();
        }

        let successes: Vec<Metric> = sink
            .snapshot()
            .into_iter()
            .filter(|m| m.name == METRIC_TOOL_SUCCESS)
            .collect();
        let with_tenant = successes
            .iter()
            .filter(|m| m.dimensions.iter().any(|(k, _)| k == "tenant_id"))
            .count();
        // Rate 0.5 → every 2nd success: exactly one of the two sampled.
        assert_eq!(with_tenant, 1);
    }
}
