//! Tool-gateway seam.
//!
//! The gateway performs the actual external side effect; the core only
//! defines the contract and the adapter-layer dedupe enforcement wrapped
//! around it. [`DedupingGateway`] is the single choke-point between the
//! orchestrator and any transport: it answers replays from the dedupe
//! store without re-invoking the tool, records fresh writes, and turns a
//! ref-set mismatch into the operational alarm the contract demands.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use axp_idempotency::{DedupeStore, IdempotencyError};
use axp_ledger::{EventLedger, EventRecord, IDEMPOTENCY_COLLISION};
use axp_resilience::{Metric, MetricsSink};
use axp_schemas::{InvocationEnvelope, ToolInvocationResponse};
use axp_store::KvStore;

pub const METRIC_IDEMPOTENCY_COLLISION: &str = "idempotency_collision";

/// The downstream collaborator that performs the side effect.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    async fn invoke(&self, request: &InvocationEnvelope) -> anyhow::Result<ToolInvocationResponse>;
}

#[async_trait]
impl<T: ToolGateway + ?Sized> ToolGateway for Arc<T> {
    async fn invoke(&self, request: &InvocationEnvelope) -> anyhow::Result<ToolInvocationResponse> {
        (**self).invoke(request).await
    }
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// Plain HTTP transport: POSTs the invocation envelope to `gateway_url`
/// and decodes the response envelope. Transport and non-2xx failures are
/// generic errors the outer retry policy owns.
pub struct HttpToolGateway {
    client: reqwest::Client,
}

impl HttpToolGateway {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpToolGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolGateway for HttpToolGateway {
    async fn invoke(&self, request: &InvocationEnvelope) -> anyhow::Result<ToolInvocationResponse> {
        let resp = self
            .client
            .post(&request.gateway_url)
            .json(request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!(e).context("tool gateway request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("tool gateway returned {status}: {body}");
        }

        resp.json::<ToolInvocationResponse>()
            .await
            .map_err(|e| anyhow::anyhow!(e).context("tool gateway response decode failed"))
    }
}

// ---------------------------------------------------------------------------
// Adapter-layer dedupe enforcement
// ---------------------------------------------------------------------------

/// Wraps any transport with the external-write dedupe protocol:
///
/// 1. A key already recorded with the same refs answers from the store;
///    the tool is not invoked again.
/// 2. A fresh successful write is recorded under the envelope's
///    idempotency key.
/// 3. A recorded key re-appearing with different refs raises the
///    collision alarm: ledger record, structured log, metric, and a
///    non-retryable error.
pub struct DedupingGateway<G: ToolGateway, S: KvStore> {
    inner: G,
    dedupe: DedupeStore<S>,
    ledger: EventLedger<S>,
    metrics: Arc<dyn MetricsSink>,
}

impl<G: ToolGateway, S: KvStore> DedupingGateway<G, S> {
    pub fn new(
        inner: G,
        dedupe: DedupeStore<S>,
        ledger: EventLedger<S>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            inner,
            dedupe,
            ledger,
            metrics,
        }
    }
}

#[async_trait]
impl<G: ToolGateway, S: KvStore> ToolGateway for DedupingGateway<G, S> {
    async fn invoke(&self, request: &InvocationEnvelope) -> anyhow::Result<ToolInvocationResponse> {
        if let Some(recorded) = self
            .dedupe
            .check_external_write(&request.idempotency_key)
            .await?
        {
            info!(
                action_intent_id = %request.action_intent_id,
                recorded_intent = %recorded.action_intent_id,
                "external write already recorded; replaying refs without invoking the tool"
            );
            return Ok(ToolInvocationResponse {
                success: true,
                external_object_refs: recorded.external_object_refs,
                tool_run_ref: format!("deduped-{}", recorded.action_intent_id),
                raw_response_artifact_ref: None,
                error_code: None,
                error_class: None,
                error_message: None,
            });
        }

        let response = self.inner.invoke(request).await?;

        if response.success && !response.external_object_refs.is_empty() {
            match self
                .dedupe
                .record_external_write(
                    &request.idempotency_key,
                    &response.external_object_refs,
                    &request.action_intent_id,
                    &request.tool_name,
                )
                .await
            {
                Ok(()) => {}
                Err(IdempotencyError::Collision { key, existing, incoming }) => {
                    error!(
                        key = %key,
                        action_intent_id = %request.action_intent_id,
                        tool_name = %request.tool_name,
                        "idempotency collision after tool invocation"
                    );
                    self.ledger
                        .append_best_effort(
                            &EventRecord::new(
                                IDEMPOTENCY_COLLISION,
                                &request.tenant_id,
                                &request.account_id,
                                &request.trace_id,
                            )
                            .with_data(json!({
                                "idempotency_key": &key,
                                "action_intent_id": &request.action_intent_id,
                                "existing_refs": &existing,
                                "incoming_refs": &incoming,
                            })),
                        )
                        .await;
                    if let Err(e) = self.metrics.emit(Metric {
                        name: METRIC_IDEMPOTENCY_COLLISION,
                        value: 1.0,
                        dimensions: vec![
                            ("tool_name".to_string(), request.tool_name.clone()),
                            ("tenant_id".to_string(), request.tenant_id.clone()),
                        ],
                    }) {
                        tracing::warn!(error = %e, "collision metric emission failed");
                    }
                    return Err(anyhow::Error::new(IdempotencyError::Collision {
                        key,
                        existing,
                        incoming,
                    })
                    .context("external write dedupe collision"));
                }
                Err(IdempotencyError::Store(e)) => {
                    return Err(anyhow::Error::new(e).context("dedupe record failed"))
                }
            }
        }

        Ok(response)
    }
}
