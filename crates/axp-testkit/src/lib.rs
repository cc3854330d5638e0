//! Test harness for the execution pipeline.
//!
//! Wires the full orchestrator against the in-memory store and a scripted
//! tool gateway, with seed helpers standing in for the upstream approval
//! pipeline. The scenario tests under `tests/` drive the same components
//! production wiring uses; only the storage backend and the transport are
//! swapped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use serde_json::{json, Value};

use axp_config::ExecutionConfig;
use axp_execution::{AttemptStore, IntentStore, OutcomeStore};
use axp_idempotency::DedupeStore;
use axp_ledger::EventLedger;
use axp_policy::PolicyStore;
use axp_registry::{NewRegistryEntry, RegistryStore};
use axp_resilience::RecordingMetricsSink;
use axp_runtime::{DedupingGateway, Orchestrator, ToolGateway};
use axp_schemas::{
    ActionIntent, CompensationStrategy, ExternalObjectRef, InvocationEnvelope, ParamTransform,
    ParameterMapping, RiskClass, ToolInvocationResponse,
};
use axp_store::MemoryKvStore;

pub const GATEWAY_URL: &str = "http://tool-gateway.test/invoke";

// ---------------------------------------------------------------------------
// Scripted tool gateway
// ---------------------------------------------------------------------------

/// Deterministic gateway double: returns scripted responses in order and
/// records every invocation envelope it sees. With nothing scripted, every
/// call succeeds with a single CRM-task ref derived from the intent id.
#[derive(Default)]
pub struct ScriptedToolGateway {
    script: Mutex<VecDeque<anyhow::Result<ToolInvocationResponse>>>,
    invocations: Mutex<Vec<InvocationEnvelope>>,
}

impl ScriptedToolGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: ToolInvocationResponse) {
        self.script.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_error(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(anyhow::anyhow!("{message}")));
    }

    pub fn invocations(&self) -> Vec<InvocationEnvelope> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    fn default_response(request: &InvocationEnvelope) -> ToolInvocationResponse {
        ToolInvocationResponse {
            success: true,
            external_object_refs: vec![ExternalObjectRef {
                system: "CRM".to_string(),
                object_type: "Task".to_string(),
                object_id: format!("obj-{}", request.action_intent_id),
                object_url: None,
            }],
            tool_run_ref: format!("run-{}", request.action_intent_id),
            raw_response_artifact_ref: None,
            error_code: None,
            error_class: None,
            error_message: None,
        }
    }
}

#[async_trait::async_trait]
impl ToolGateway for ScriptedToolGateway {
    async fn invoke(&self, request: &InvocationEnvelope) -> anyhow::Result<ToolInvocationResponse> {
        self.invocations.lock().unwrap().push(request.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(Self::default_response(request)),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub type HarnessOrchestrator =
    Orchestrator<Arc<MemoryKvStore>, DedupingGateway<Arc<ScriptedToolGateway>, Arc<MemoryKvStore>>>;

pub struct TestHarness {
    pub store: Arc<MemoryKvStore>,
    pub gateway: Arc<ScriptedToolGateway>,
    pub metrics: Arc<RecordingMetricsSink>,
    pub config: ExecutionConfig,
    pub orchestrator: HarnessOrchestrator,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(ExecutionConfig::default())
    }

    pub fn with_config(config: ExecutionConfig) -> Self {
        let store = Arc::new(MemoryKvStore::new());
        let gateway = Arc::new(ScriptedToolGateway::new());
        let metrics = Arc::new(RecordingMetricsSink::new());

        let deduping = DedupingGateway::new(
            gateway.clone(),
            DedupeStore::new(store.clone()).with_retention_days(config.dedupe_retention_days),
            EventLedger::new(store.clone()),
            metrics.clone(),
        );
        let orchestrator =
            Orchestrator::new(store.clone(), deduping, metrics.clone(), &config, GATEWAY_URL);

        Self {
            store,
            gateway,
            metrics,
            config,
            orchestrator,
        }
    }

    // Component views over the same store.

    pub fn intents(&self) -> IntentStore<Arc<MemoryKvStore>> {
        IntentStore::new(self.store.clone())
    }

    pub fn attempts(&self) -> AttemptStore<Arc<MemoryKvStore>> {
        AttemptStore::new(self.store.clone())
    }

    pub fn outcomes(&self) -> OutcomeStore<Arc<MemoryKvStore>> {
        OutcomeStore::new(self.store.clone())
    }

    pub fn registry(&self) -> RegistryStore<Arc<MemoryKvStore>> {
        RegistryStore::new(self.store.clone())
    }

    pub fn policy(&self) -> PolicyStore<Arc<MemoryKvStore>> {
        PolicyStore::new(self.store.clone())
    }

    pub fn dedupe(&self) -> DedupeStore<Arc<MemoryKvStore>> {
        DedupeStore::new(self.store.clone())
    }

    pub fn ledger(&self) -> EventLedger<Arc<MemoryKvStore>> {
        EventLedger::new(self.store.clone())
    }

    pub async fn seed_intent(&self, intent: &ActionIntent) {
        self.intents().seed(intent).await.expect("seed intent");
    }

    /// Register a registry entry with PASSTHROUGH mappings for the given
    /// required fields. Versions are auto-assigned (1, 2, ...).
    pub async fn seed_registry(
        &self,
        action_type: &str,
        tool_name: &str,
        required_fields: &[&str],
        compensation_strategy: CompensationStrategy,
    ) -> i64 {
        let entry = NewRegistryEntry {
            action_type: action_type.to_string(),
            tool_name: tool_name.to_string(),
            tool_schema_version: "1.0".to_string(),
            required_scopes: vec![],
            risk_class: RiskClass::Low,
            compensation_strategy,
            parameter_mapping: required_fields
                .iter()
                .map(|f| ParameterMapping {
                    source_field: f.to_string(),
                    target_field: f.to_string(),
                    transform: ParamTransform::Passthrough,
                    required: true,
                })
                .collect(),
        };
        self.registry()
            .register(entry)
            .await
            .expect("register entry")
            .registry_version
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Intent builder
// ---------------------------------------------------------------------------

/// An approved intent two hours from expiry, in the shape the approval
/// pipeline produces.
pub fn make_intent(
    id: &str,
    tenant: &str,
    account: &str,
    action_type: &str,
    parameters: Value,
    registry_version: Option<i64>,
) -> ActionIntent {
    let expires = Utc::now() + Duration::hours(2);
    ActionIntent {
        action_intent_id: id.to_string(),
        tenant_id: tenant.to_string(),
        account_id: account.to_string(),
        action_type: action_type.to_string(),
        parameters,
        approved_by: Some("ops@example.com".to_string()),
        approval_source: None,
        expires_at: expires,
        expires_at_epoch: expires.timestamp(),
        registry_version,
        trace_id: format!("decision-{id}"),
        original_proposal_id: format!("prop-{id}"),
        original_decision_id: format!("prop-{id}"),
    }
}

/// An already-expired intent.
pub fn make_expired_intent(
    id: &str,
    tenant: &str,
    account: &str,
    action_type: &str,
    registry_version: Option<i64>,
) -> ActionIntent {
    let mut intent = make_intent(id, tenant, account, action_type, json!({"title": "x"}), registry_version);
    let past = Utc::now() - Duration::hours(1);
    intent.expires_at = past;
    intent.expires_at_epoch = past.timestamp();
    intent
}
