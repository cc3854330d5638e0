//! The execution state machine.
//!
//! Steps: Start → ValidatePreflight → MapActionToTool → InvokeTool →
//! RecordOutcome, with Compensate on the failure branch and RecordFailure
//! for every pre-tool failure. Each step is an independent method consuming
//! and producing a strict envelope; the orchestration runtime sequences
//! them per intent; [`Orchestrator::execute`] is the in-process driver used
//! by the admin rerun path and the scenario harness.
//!
//! The orchestrator is stateless between steps. Exactly-once rests on the
//! attempt lock and the write-once outcome store, not on scheduling.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use axp_config::ExecutionConfig;
use axp_execution::{
    AttemptError, AttemptStore, IntentStore, OutcomeError, OutcomeStore, StartAttemptArgs,
    TerminalStatus,
};
use axp_idempotency::{execution_key, IdempotencyError};
use axp_ledger::{EventLedger, EventRecord, ACTION_EXECUTED, ACTION_FAILED, EXECUTION_STARTED};
use axp_policy::PolicyStore;
use axp_registry::{MappingError, RegistryStore};
use axp_resilience::{
    BreakerConfig, CallType, CircuitBreaker, ConcurrencyLimiter, InvokeError, Invoked,
    MetricsSink, ResilientInvoker,
};
use axp_schemas::{
    validate_tool_arguments, ActionOutcome, CompensationStatus, CompensationStrategy, ErrorClass,
    ErrorShape, FailureInput, InvocationEnvelope, OutcomeStatus, RecordInput, StartInput,
    StepHandoff,
};
use axp_store::{KvStore, StoreError};

use crate::classify::{
    classify_failure, CODE_MISSING_REGISTRY_VERSION, CODE_MISSING_REQUIRED_PARAMETER,
    CODE_REGISTRY_VERSION_MISSING, CODE_TOOL_ARGUMENTS_OVERSIZE, CODE_TOOL_MAPPING_NOT_FOUND,
};
use crate::gateway::ToolGateway;

// ---------------------------------------------------------------------------
// Step errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StepError {
    #[error("intent not found: {action_intent_id}")]
    IntentNotFound { action_intent_id: String },
    #[error("validation failed ({code}): {message}")]
    Validation { code: String, message: String },
    #[error("kill switch refused execution: {cause}")]
    KillSwitch { cause: String },
    #[error("intent expired at epoch {expires_at_epoch}")]
    IntentExpired { expires_at_epoch: i64 },
    #[error("circuit breaker open for connector {connector_id}; retry after {retry_after_seconds}s")]
    CircuitOpen {
        connector_id: String,
        retry_after_seconds: i64,
    },
    /// Backpressure deferral: the runtime re-enqueues after the hint.
    /// Never routed to failure recording.
    #[error("invocation deferred; retry after {retry_after_seconds}s")]
    Deferred { retry_after_seconds: i64 },
    #[error(transparent)]
    Attempt(#[from] AttemptError),
    #[error(transparent)]
    Outcome(#[from] OutcomeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepError {
    /// The `(Error, Cause)` shape failure recording classifies from.
    pub fn error_shape(&self) -> ErrorShape {
        let (error, cause) = match self {
            StepError::IntentNotFound { .. } => ("INTENT_NOT_FOUND", self.to_string()),
            StepError::Validation { code, message } => {
                ("ValidationError", format!("{code}: {message}"))
            }
            StepError::KillSwitch { cause } => ("ValidationError", cause.clone()),
            StepError::IntentExpired { .. } => ("INTENT_EXPIRED", self.to_string()),
            StepError::CircuitOpen { .. } => ("CircuitBreakerOpen", self.to_string()),
            StepError::Deferred { .. } => ("Deferred", self.to_string()),
            StepError::Attempt(e) => ("ExecutionAttemptError", e.to_string()),
            StepError::Outcome(e) => ("OutcomeStoreError", e.to_string()),
            StepError::Store(e) => ("StoreError", e.to_string()),
            StepError::Other(e) => ("Error", format!("{e:#}")),
        };
        ErrorShape {
            error: Some(error.to_string()),
            cause: Some(cause),
        }
    }

    /// Pre-tool failures terminate with a FAILED outcome; everything else
    /// (deferrals, transient I/O, lock contention) propagates so the outer
    /// runtime can retry or drop the duplicate delivery.
    fn is_recordable_failure(&self) -> bool {
        match self {
            StepError::IntentNotFound { .. }
            | StepError::Validation { .. }
            | StepError::KillSwitch { .. }
            | StepError::IntentExpired { .. }
            | StepError::CircuitOpen { .. } => true,
            StepError::Deferred { .. }
            | StepError::Attempt(_)
            | StepError::Outcome(_)
            | StepError::Store(_) => false,
            // A dedupe collision is terminal and never retried; other
            // gateway/transport errors stay retryable.
            StepError::Other(e) => e.downcast_ref::<IdempotencyError>().is_some(),
        }
    }
}

/// Result of the compensation routing step. Routing only: the AUTOMATIC
/// rollback tool invocation is deliberately deferred.
#[derive(Debug, Clone)]
pub struct CompensationResult {
    pub status: CompensationStatus,
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator<S: KvStore + Clone, G: ToolGateway> {
    intents: IntentStore<S>,
    attempts: AttemptStore<S>,
    outcomes: OutcomeStore<S>,
    registry: RegistryStore<S>,
    policy: PolicyStore<S>,
    ledger: EventLedger<S>,
    invoker: ResilientInvoker<S>,
    gateway: G,
    gateway_url: String,
    orchestration_timeout_seconds: i64,
}

impl<S: KvStore + Clone, G: ToolGateway> Orchestrator<S, G> {
    pub fn new(
        store: S,
        gateway: G,
        metrics: Arc<dyn MetricsSink>,
        config: &ExecutionConfig,
        gateway_url: impl Into<String>,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            store.clone(),
            BreakerConfig {
                failure_threshold: config.breaker_failure_threshold,
                window_seconds: config.breaker_window_seconds,
                cooldown_seconds: config.breaker_cooldown_seconds,
            },
        );
        let limiter = ConcurrencyLimiter::new(
            config.concurrency_default_capacity.max(0) as usize,
            config.concurrency_retry_after_seconds,
        )
        .with_connector_capacities(
            config
                .concurrency_per_connector
                .iter()
                .map(|(k, v)| (k.clone(), (*v).max(0) as usize))
                .collect(),
        );

        Self {
            intents: IntentStore::new(store.clone()),
            attempts: AttemptStore::new(store.clone())
                .with_ttl_buffer_seconds(config.attempt_ttl_buffer_seconds),
            outcomes: OutcomeStore::new(store.clone())
                .with_retention_days(config.outcome_retention_days),
            registry: RegistryStore::new(store.clone()),
            policy: PolicyStore::new(store.clone()),
            ledger: EventLedger::new(store.clone()),
            invoker: ResilientInvoker::new(breaker, limiter, metrics)
                .with_slo_sample_rate(config.slo_sample_rate),
            gateway,
            gateway_url: gateway_url.into(),
            orchestration_timeout_seconds: config.orchestration_timeout_seconds(),
        }
    }

    /// Strict parse of the external trigger event; unknown fields reject.
    pub fn parse_start_event(event: &Value) -> Result<StartInput, StepError> {
        serde_json::from_value(event.clone()).map_err(|e| StepError::Validation {
            code: "INVALID_START_EVENT".to_string(),
            message: e.to_string(),
        })
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Validate the intent, resolve the tool mapping, derive the execution
    /// idempotency key, and take the exclusive RUNNING lock. Parameter
    /// mapping runs here too, so a missing required field fails before the
    /// lock is taken.
    pub async fn start(&self, input: StartInput) -> Result<StepHandoff, StepError> {
        self.start_inner(input, false).await
    }

    /// Admin rerun path: identical to [`start`](Self::start) but allows the
    /// terminal → RUNNING transition.
    pub async fn start_rerun(&self, input: StartInput) -> Result<StepHandoff, StepError> {
        self.start_inner(input, true).await
    }

    async fn start_inner(
        &self,
        input: StartInput,
        allow_rerun: bool,
    ) -> Result<StepHandoff, StepError> {
        // Execution trace: fresh per lifecycle, distinct from the decision
        // trace the intent carries.
        let execution_trace_id = Uuid::new_v4().to_string();

        let intent = self
            .intents
            .get(&input.action_intent_id, &input.tenant_id, &input.account_id)
            .await?
            .ok_or_else(|| StepError::IntentNotFound {
                action_intent_id: input.action_intent_id.clone(),
            })?;

        let registry_version = intent.registry_version.ok_or_else(|| StepError::Validation {
            code: CODE_MISSING_REGISTRY_VERSION.to_string(),
            message: format!(
                "intent {} carries no registry_version; deterministic execution requires one",
                intent.action_intent_id
            ),
        })?;

        let entry = self
            .registry
            .get_mapping(&intent.action_type, Some(registry_version))
            .await?
            .ok_or_else(|| StepError::Validation {
                code: CODE_TOOL_MAPPING_NOT_FOUND.to_string(),
                message: format!(
                    "no registry entry for ({}, {registry_version})",
                    intent.action_type
                ),
            })?;

        // Surface missing-required failures before the lock is taken.
        RegistryStore::<S>::map_parameters(&entry, &intent.parameters).map_err(
            |MappingError::MissingRequired { field }| StepError::Validation {
                code: CODE_MISSING_REQUIRED_PARAMETER.to_string(),
                message: format!("required parameter missing: {field}"),
            },
        )?;

        let idempotency_key = execution_key(
            &intent.tenant_id,
            &intent.action_intent_id,
            &entry.tool_name,
            &intent.parameters,
            registry_version,
        );

        let attempt = self
            .attempts
            .start_attempt(StartAttemptArgs {
                action_intent_id: input.action_intent_id.clone(),
                tenant_id: input.tenant_id.clone(),
                account_id: input.account_id.clone(),
                execution_trace_id: execution_trace_id.clone(),
                idempotency_key: idempotency_key.clone(),
                orchestration_timeout_seconds: Some(self.orchestration_timeout_seconds),
                allow_rerun,
            })
            .await?;

        // Best-effort but expected; absence is tolerated downstream.
        self.ledger
            .append_best_effort(
                &EventRecord::new(
                    EXECUTION_STARTED,
                    &input.tenant_id,
                    &input.account_id,
                    &execution_trace_id,
                )
                .with_decision_trace(&intent.trace_id)
                .with_data(json!({
                    "action_intent_id": input.action_intent_id,
                    "idempotency_key": idempotency_key,
                    "registry_version": registry_version,
                    "attempt_count": attempt.attempt_count,
                })),
            )
            .await;

        info!(
            action_intent_id = %input.action_intent_id,
            tenant_id = %input.tenant_id,
            trace_id = %execution_trace_id,
            attempt_count = attempt.attempt_count,
            "execution started"
        );

        Ok(StepHandoff {
            action_intent_id: input.action_intent_id,
            tenant_id: input.tenant_id,
            account_id: input.account_id,
            trace_id: execution_trace_id,
            idempotency_key,
            registry_version,
            attempt_count: attempt.attempt_count,
            started_at: attempt.started_at,
            validation_result: None,
            approval_source: None,
            auto_executed: None,
        })
    }

    // -----------------------------------------------------------------------
    // ValidatePreflight
    // -----------------------------------------------------------------------

    /// Remaining pre-tool checks: kill switches and intent expiry. No
    /// external side effects; pass-through on success.
    pub async fn validate_preflight(&self, handoff: StepHandoff) -> Result<StepHandoff, StepError> {
        let intent = self
            .intents
            .get(&handoff.action_intent_id, &handoff.tenant_id, &handoff.account_id)
            .await?
            .ok_or_else(|| StepError::IntentNotFound {
                action_intent_id: handoff.action_intent_id.clone(),
            })?;

        let verdict = self
            .policy
            .is_execution_enabled(&handoff.tenant_id, Some(&intent.action_type))
            .await?;
        if let Some(cause) = verdict.refusal_cause() {
            return Err(StepError::KillSwitch { cause });
        }

        if intent.is_expired(Utc::now().timestamp()) {
            return Err(StepError::IntentExpired {
                expires_at_epoch: intent.expires_at_epoch,
            });
        }

        Ok(handoff)
    }

    // -----------------------------------------------------------------------
    // MapActionToTool
    // -----------------------------------------------------------------------

    /// Re-read the intent and build the invocation envelope the gateway
    /// expects, with the idempotency key and intent id folded into the tool
    /// arguments for adapter-level dedupe.
    pub async fn map_action_to_tool(
        &self,
        handoff: StepHandoff,
    ) -> Result<InvocationEnvelope, StepError> {
        let intent = self
            .intents
            .get(&handoff.action_intent_id, &handoff.tenant_id, &handoff.account_id)
            .await?
            .ok_or_else(|| StepError::IntentNotFound {
                action_intent_id: handoff.action_intent_id.clone(),
            })?;

        let entry = self
            .registry
            .get_mapping(&intent.action_type, Some(handoff.registry_version))
            .await?
            .ok_or_else(|| StepError::Validation {
                code: CODE_TOOL_MAPPING_NOT_FOUND.to_string(),
                message: format!(
                    "no registry entry for ({}, {})",
                    intent.action_type, handoff.registry_version
                ),
            })?;

        let mut tool_arguments = RegistryStore::<S>::map_parameters(&entry, &intent.parameters)
            .map_err(|MappingError::MissingRequired { field }| StepError::Validation {
                code: CODE_MISSING_REQUIRED_PARAMETER.to_string(),
                message: format!("required parameter missing: {field}"),
            })?;
        tool_arguments.insert(
            "idempotency_key".to_string(),
            json!(handoff.idempotency_key),
        );
        tool_arguments.insert(
            "action_intent_id".to_string(),
            json!(handoff.action_intent_id),
        );
        let tool_arguments = Value::Object(tool_arguments);

        validate_tool_arguments(&tool_arguments).map_err(|e| StepError::Validation {
            code: CODE_TOOL_ARGUMENTS_OVERSIZE.to_string(),
            message: e.to_string(),
        })?;

        Ok(InvocationEnvelope {
            action_intent_id: handoff.action_intent_id,
            tenant_id: handoff.tenant_id,
            account_id: handoff.account_id,
            trace_id: handoff.trace_id,
            gateway_url: self.gateway_url.clone(),
            tool_name: entry.tool_name,
            tool_arguments,
            tool_schema_version: entry.tool_schema_version,
            registry_version: handoff.registry_version,
            compensation_strategy: entry.compensation_strategy,
            idempotency_key: handoff.idempotency_key,
            attempt_count: handoff.attempt_count,
            started_at: handoff.started_at,
        })
    }

    // -----------------------------------------------------------------------
    // InvokeTool
    // -----------------------------------------------------------------------

    /// Hand the envelope to the gateway through the resilience wrapper.
    /// Open circuit is fatal for this step; backpressure defers.
    pub async fn invoke_tool(&self, envelope: InvocationEnvelope) -> Result<RecordInput, StepError> {
        let outcome = self
            .invoker
            .invoke(
                &envelope.tool_name,
                Some(&envelope.tenant_id),
                CallType::Phase4Execution,
                || self.gateway.invoke(&envelope),
            )
            .await;

        let response = match outcome {
            Ok(Invoked::Success(resp)) => resp,
            Ok(Invoked::Deferred { retry_after_seconds }) => {
                return Err(StepError::Deferred { retry_after_seconds })
            }
            Err(InvokeError::CircuitOpen {
                connector_id,
                retry_after_seconds,
            }) => {
                return Err(StepError::CircuitOpen {
                    connector_id,
                    retry_after_seconds,
                })
            }
            Err(InvokeError::Store(e)) => return Err(e.into()),
            Err(InvokeError::Tool(e)) => return Err(StepError::Other(e)),
        };

        Ok(RecordInput {
            action_intent_id: envelope.action_intent_id,
            tenant_id: envelope.tenant_id,
            account_id: envelope.account_id,
            trace_id: envelope.trace_id,
            tool_name: envelope.tool_name,
            tool_schema_version: envelope.tool_schema_version,
            registry_version: envelope.registry_version,
            compensation_strategy: envelope.compensation_strategy,
            idempotency_key: envelope.idempotency_key,
            attempt_count: envelope.attempt_count,
            started_at: envelope.started_at,
            success: response.success,
            external_object_refs: response.external_object_refs,
            tool_run_ref: response.tool_run_ref,
            raw_response_artifact_ref: response.raw_response_artifact_ref,
            error_code: response.error_code,
            error_class: response.error_class,
            error_message: response.error_message,
            compensation_status: None,
        })
    }

    // -----------------------------------------------------------------------
    // Compensate
    // -----------------------------------------------------------------------

    /// Route compensation for a failed invocation that left side effects.
    /// Never throws; problems surface as `compensation_status = FAILED`.
    pub fn compensate(&self, input: &RecordInput) -> CompensationResult {
        match input.compensation_strategy {
            CompensationStrategy::None => CompensationResult {
                status: CompensationStatus::Completed,
                reason: Some("not supported".to_string()),
            },
            CompensationStrategy::Manual => CompensationResult {
                status: CompensationStatus::Pending,
                reason: Some("manual compensation required".to_string()),
            },
            // Routed but deliberately unimplemented: the rollback tool
            // invocation is a future seam.
            CompensationStrategy::Automatic => CompensationResult {
                status: CompensationStatus::Pending,
                reason: Some("automatic compensation routed; rollback pending".to_string()),
            },
        }
    }

    // -----------------------------------------------------------------------
    // RecordOutcome
    // -----------------------------------------------------------------------

    /// Write the terminal outcome (write-once), transition the attempt, and
    /// append the terminal ledger record with both traces.
    pub async fn record_outcome(&self, input: RecordInput) -> Result<ActionOutcome, StepError> {
        let status = if input.success {
            OutcomeStatus::Succeeded
        } else {
            OutcomeStatus::Failed
        };
        let terminal = if input.success {
            TerminalStatus::Succeeded
        } else {
            TerminalStatus::Failed
        };

        let outcome = ActionOutcome {
            action_intent_id: input.action_intent_id.clone(),
            tenant_id: input.tenant_id.clone(),
            account_id: input.account_id.clone(),
            status,
            external_object_refs: input.external_object_refs.clone(),
            error_class: input.error_class.clone(),
            error_code: input.error_code.clone(),
            error_message: input.error_message.clone(),
            tool_name: input.tool_name.clone(),
            tool_schema_version: input.tool_schema_version.clone(),
            registry_version: input.registry_version,
            tool_run_ref: input.tool_run_ref.clone(),
            raw_response_artifact_ref: input.raw_response_artifact_ref.clone(),
            attempt_count: input.attempt_count,
            started_at: input.started_at,
            completed_at: Utc::now(),
            compensation_status: input.compensation_status.unwrap_or(CompensationStatus::None),
            trace_id: input.trace_id.clone(),
        };

        let stored = self.outcomes.record(outcome).await?;

        self.transition_attempt(
            &input.action_intent_id,
            &input.tenant_id,
            &input.account_id,
            terminal,
            input.error_class.as_deref(),
        )
        .await?;

        // One more intent read for the decision trace.
        let decision_trace = self
            .intents
            .get(&input.action_intent_id, &input.tenant_id, &input.account_id)
            .await
            .ok()
            .flatten()
            .map(|i| i.trace_id);

        let event_type = if input.success { ACTION_EXECUTED } else { ACTION_FAILED };
        let mut record = EventRecord::new(
            event_type,
            &input.tenant_id,
            &input.account_id,
            &input.trace_id,
        )
        .with_data(json!({
            "action_intent_id": input.action_intent_id,
            "tool_run_ref": stored.tool_run_ref,
            "status": stored.status,
            "external_object_refs": stored.external_object_refs,
            "error_class": stored.error_class,
        }));
        if let Some(trace) = decision_trace {
            record = record.with_decision_trace(trace);
        }
        self.ledger.append_best_effort(&record).await;

        Ok(stored)
    }

    // -----------------------------------------------------------------------
    // RecordFailure
    // -----------------------------------------------------------------------

    /// Terminal handler for every pre-tool failure. Classifies the error,
    /// writes the pre-tool failure outcome, fails the attempt, and appends
    /// `ACTION_FAILED`.
    pub async fn record_failure(&self, input: FailureInput) -> Result<ActionOutcome, StepError> {
        let intent = self
            .intents
            .get(&input.action_intent_id, &input.tenant_id, &input.account_id)
            .await
            .ok()
            .flatten();

        let registry_version = input
            .registry_version
            .or_else(|| intent.as_ref().and_then(|i| i.registry_version));

        let shape = input.error.clone().unwrap_or_default();
        let (error_class, error_code, error_message) = if registry_version.is_none() {
            (
                ErrorClass::Validation,
                Some(CODE_REGISTRY_VERSION_MISSING.to_string()),
                format!(
                    "intent {} has no registry_version; execution rejected before tool selection",
                    input.action_intent_id
                ),
            )
        } else {
            let class = classify_failure(&shape);
            let message = shape
                .cause
                .clone()
                .or_else(|| shape.error.clone())
                .unwrap_or_else(|| "unclassified pre-tool failure".to_string());
            (class, None, message)
        };

        let attempt = self
            .attempts
            .get_attempt(&input.action_intent_id, &input.tenant_id, &input.account_id)
            .await
            .ok()
            .flatten();

        let now = Utc::now();
        let outcome = ActionOutcome {
            action_intent_id: input.action_intent_id.clone(),
            tenant_id: input.tenant_id.clone(),
            account_id: input.account_id.clone(),
            status: OutcomeStatus::Failed,
            external_object_refs: vec![],
            error_class: Some(error_class.as_str().to_string()),
            error_code,
            error_message: Some(error_message),
            tool_name: "unknown".to_string(),
            tool_schema_version: "unknown".to_string(),
            registry_version: registry_version.unwrap_or(0),
            tool_run_ref: format!("pre-tool-failure-{}", input.action_intent_id),
            raw_response_artifact_ref: None,
            attempt_count: input
                .attempt_count
                .or_else(|| attempt.as_ref().map(|a| a.attempt_count))
                .unwrap_or(0),
            started_at: input
                .started_at
                .or_else(|| attempt.as_ref().map(|a| a.started_at))
                .unwrap_or(now),
            completed_at: now,
            compensation_status: CompensationStatus::None,
            trace_id: input
                .trace_id
                .clone()
                .or_else(|| attempt.as_ref().map(|a| a.trace_id.clone()))
                .unwrap_or_else(|| "unknown".to_string()),
        };

        let stored = self.outcomes.record(outcome).await?;

        // The attempt may predate the failure (post-lock) or not exist at
        // all (failure before Start took the lock); both are fine here.
        if let Err(e) = self
            .attempts
            .update_status(
                &input.action_intent_id,
                &input.tenant_id,
                &input.account_id,
                TerminalStatus::Failed,
                Some(error_class.as_str()),
            )
            .await
        {
            match e {
                AttemptError::InvalidTransition { .. } => {
                    warn!(
                        action_intent_id = %input.action_intent_id,
                        error = %e,
                        "attempt not transitioned while recording failure"
                    );
                }
                other => return Err(other.into()),
            }
        }

        let mut record = EventRecord::new(
            ACTION_FAILED,
            &input.tenant_id,
            &input.account_id,
            &stored.trace_id,
        )
        .with_data(json!({
            "action_intent_id": input.action_intent_id,
            "error_class": stored.error_class,
            "error_code": stored.error_code,
            "error_message": stored.error_message,
        }));
        if let Some(intent) = &intent {
            record = record.with_decision_trace(&intent.trace_id);
        }
        self.ledger.append_best_effort(&record).await;

        Ok(stored)
    }

    // -----------------------------------------------------------------------
    // In-process driver
    // -----------------------------------------------------------------------

    /// Drive all steps for one intent, routing pre-tool failures through
    /// RecordFailure. Deferrals, transient store errors, and lock
    /// contention propagate to the caller's retry policy.
    pub async fn execute(&self, input: StartInput) -> Result<ActionOutcome, StepError> {
        self.execute_inner(input, false).await
    }

    /// Admin rerun: same pipeline with the terminal → RUNNING gate open.
    pub async fn rerun(&self, input: StartInput) -> Result<ActionOutcome, StepError> {
        self.execute_inner(input, true).await
    }

    async fn execute_inner(
        &self,
        input: StartInput,
        allow_rerun: bool,
    ) -> Result<ActionOutcome, StepError> {
        let handoff = match self.start_inner(input.clone(), allow_rerun).await {
            Ok(h) => h,
            Err(e) => return self.route_failure(&input, None, e).await,
        };

        let handoff = match self.validate_preflight(handoff.clone()).await {
            Ok(h) => h,
            Err(e) => return self.route_failure(&input, Some(&handoff), e).await,
        };

        let envelope = match self.map_action_to_tool(handoff.clone()).await {
            Ok(env) => env,
            Err(e) => return self.route_failure(&input, Some(&handoff), e).await,
        };

        let mut record_input = match self.invoke_tool(envelope).await {
            Ok(r) => r,
            Err(e) => return self.route_failure(&input, Some(&handoff), e).await,
        };

        if !record_input.success
            && record_input.compensation_strategy != CompensationStrategy::None
            && !record_input.external_object_refs.is_empty()
        {
            let compensation = self.compensate(&record_input);
            record_input.compensation_status = Some(compensation.status);
        }

        self.record_outcome(record_input).await
    }

    async fn route_failure(
        &self,
        input: &StartInput,
        state: Option<&StepHandoff>,
        err: StepError,
    ) -> Result<ActionOutcome, StepError> {
        if !err.is_recordable_failure() {
            return Err(err);
        }

        warn!(
            action_intent_id = %input.action_intent_id,
            error = %err,
            "pre-tool failure; recording FAILED outcome"
        );

        self.record_failure(FailureInput {
            action_intent_id: input.action_intent_id.clone(),
            tenant_id: input.tenant_id.clone(),
            account_id: input.account_id.clone(),
            trace_id: state.map(|s| s.trace_id.clone()),
            registry_version: state.map(|s| s.registry_version),
            attempt_count: state.map(|s| s.attempt_count),
            started_at: state.map(|s| s.started_at),
            error: Some(err.error_shape()),
        })
        .await
    }

    async fn transition_attempt(
        &self,
        action_intent_id: &str,
        tenant_id: &str,
        account_id: &str,
        terminal: TerminalStatus,
        error_class: Option<&str>,
    ) -> Result<(), StepError> {
        match self
            .attempts
            .update_status(action_intent_id, tenant_id, account_id, terminal, error_class)
            .await
        {
            Ok(_) => Ok(()),
            // Idempotent replay: the attempt already carries this status
            // (a second RecordOutcome after a write-once rediscovery).
            Err(AttemptError::InvalidTransition { ref found, .. })
                if found.as_str() == terminal.as_str() =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start_event_parsing_is_strict() {
        let ok = json!({"action_intent_id": "ai_1", "tenant_id": "t1", "account_id": "a1"});
        assert!(
            Orchestrator::<Arc<axp_store::MemoryKvStore>, crate::gateway::HttpToolGateway>::parse_start_event(&ok)
                .is_ok()
        );

        let extra = json!({"action_intent_id": "ai_1", "tenant_id": "t1", "account_id": "a1", "x": 1});
        let err =
            Orchestrator::<Arc<axp_store::MemoryKvStore>, crate::gateway::HttpToolGateway>::parse_start_event(&extra)
                .unwrap_err();
        assert!(matches!(err, StepError::Validation { .. }));
    }

    #[test]
    fn error_shapes_classify_to_their_intended_class() {
        let cases: Vec<(StepError, ErrorClass)> = vec![
            (
                StepError::IntentNotFound {
                    action_intent_id: "ai_1".into(),
                },
                ErrorClass::Validation,
            ),
            (
                StepError::Validation {
                    code: "TOOL_MAPPING_NOT_FOUND".into(),
                    message: "no entry".into(),
                },
                ErrorClass::Validation,
            ),
            (
                StepError::KillSwitch {
                    cause: "KILL_SWITCH_TENANT_DISABLED".into(),
                },
                ErrorClass::Validation,
            ),
            (
                StepError::IntentExpired {
                    expires_at_epoch: 0,
                },
                ErrorClass::Validation,
            ),
            (
                StepError::CircuitOpen {
                    connector_id: "internal".into(),
                    retry_after_seconds: 30,
                },
                ErrorClass::Unknown,
            ),
        ];
        for (err, want) in cases {
            assert_eq!(classify_failure(&err.error_shape()), want, "{err}");
        }
    }

    #[test]
    fn deferrals_and_lock_contention_are_not_recordable() {
        assert!(!StepError::Deferred {
            retry_after_seconds: 30
        }
        .is_recordable_failure());
        assert!(!StepError::Attempt(AttemptError::AlreadyInProgress {
            action_intent_id: "ai_1".into()
        })
        .is_recordable_failure());
        assert!(StepError::CircuitOpen {
            connector_id: "internal".into(),
            retry_after_seconds: 30
        }
        .is_recordable_failure());
    }
}
