//! Shared domain and wire types for the action execution pipeline.
//!
//! Everything that crosses a crate boundary lives here: action intents,
//! registry entries, execution attempts, outcomes, external object refs,
//! and the step envelopes exchanged by the orchestration runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod envelopes;

pub use envelopes::{
    validate_tool_arguments, EnvelopeError, ErrorShape, FailureInput, InvocationEnvelope,
    RecordInput, StartInput, StepHandoff, ToolInvocationResponse, TOOL_ARGUMENTS_MAX_BYTES,
};

// ---------------------------------------------------------------------------
// Action intent (read-only input to the pipeline)
// ---------------------------------------------------------------------------

/// An approved request to perform exactly one side-effecting action.
///
/// Produced by the upstream proposal/approval pipeline; the executor never
/// mutates it. `trace_id` is the *decision* trace assigned at proposal time;
/// the execution trace is generated fresh at Start and lives on the attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionIntent {
    pub action_intent_id: String,
    pub tenant_id: String,
    pub account_id: String,
    pub action_type: String,
    /// Opaque parameter map; shaped per action type.
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_source: Option<ApprovalSource>,
    pub expires_at: DateTime<Utc>,
    /// Epoch-seconds mirror of `expires_at`, used for TTL and expiry checks.
    pub expires_at_epoch: i64,
    /// Pins execution to an exact registry entry. Absent values are rejected
    /// at Start with `MISSING_REGISTRY_VERSION`.
    #[serde(default)]
    pub registry_version: Option<i64>,
    /// Decision trace (proposal/approval correlation).
    pub trace_id: String,
    pub original_proposal_id: String,
    pub original_decision_id: String,
}

impl ActionIntent {
    /// `true` once the intent's TTL epoch has passed.
    pub fn is_expired(&self, now_epoch: i64) -> bool {
        self.expires_at_epoch <= now_epoch
    }
}

/// Who approved the intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalSource {
    Human,
    Policy,
}

// ---------------------------------------------------------------------------
// External object refs
// ---------------------------------------------------------------------------

/// Identifies one downstream side effect (a created/updated external object).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalObjectRef {
    pub system: String,
    pub object_type: String,
    pub object_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_url: Option<String>,
}

/// Order-independent equality over two ref sets.
///
/// Both sides are sorted by `object_id` before a field-by-field compare, so
/// `[T1, T2]` and `[T2, T1]` are the same write. Used by the adapter-layer
/// dedupe store to decide "replay" vs "collision".
pub fn refs_equal(a: &[ExternalObjectRef], b: &[ExternalObjectRef]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut sa: Vec<&ExternalObjectRef> = a.iter().collect();
    let mut sb: Vec<&ExternalObjectRef> = b.iter().collect();
    sa.sort_by(|x, y| x.object_id.cmp(&y.object_id));
    sb.sort_by(|x, y| x.object_id.cmp(&y.object_id));
    sa.iter().zip(sb.iter()).all(|(x, y)| x == y)
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Running => "RUNNING",
            AttemptStatus::Succeeded => "SUCCEEDED",
            AttemptStatus::Failed => "FAILED",
            AttemptStatus::Cancelled => "CANCELLED",
        }
    }

    /// `true` for every status except `RUNNING`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptStatus::Running)
    }
}

/// Terminal status recorded on an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    Retrying,
    Cancelled,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Succeeded => "SUCCEEDED",
            OutcomeStatus::Failed => "FAILED",
            OutcomeStatus::Retrying => "RETRYING",
            OutcomeStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Status surfaced by the read API. `RETRYING` is collapsed to `RUNNING`
/// before anything leaves the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Expired,
}

/// Compensation progress recorded on an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationStatus {
    None,
    Pending,
    Completed,
    Failed,
}

/// How a side effect can be undone. Routing policy only: the AUTOMATIC
/// rollback tool invocation is a seam, not implemented here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationStrategy {
    None,
    Manual,
    Automatic,
}

/// Risk classification of an action type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskClass {
    Minimal,
    Low,
    Medium,
    High,
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Stable failure classes used for classification, alarms, and user-visible
/// messages. The strings are wire-stable; alert routing keys off them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    Validation,
    Auth,
    RateLimit,
    Downstream,
    Timeout,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "VALIDATION",
            ErrorClass::Auth => "AUTH",
            ErrorClass::RateLimit => "RATE_LIMIT",
            ErrorClass::Downstream => "DOWNSTREAM",
            ErrorClass::Timeout => "TIMEOUT",
            ErrorClass::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "VALIDATION" => Some(ErrorClass::Validation),
            "AUTH" => Some(ErrorClass::Auth),
            "RATE_LIMIT" => Some(ErrorClass::RateLimit),
            "DOWNSTREAM" => Some(ErrorClass::Downstream),
            "TIMEOUT" => Some(ErrorClass::Timeout),
            "UNKNOWN" => Some(ErrorClass::Unknown),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Parameter transform applied while mapping intent parameters to tool args.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParamTransform {
    Passthrough,
    Uppercase,
    Lowercase,
}

/// One source-field → target-field mapping rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterMapping {
    pub source_field: String,
    pub target_field: String,
    pub transform: ParamTransform,
    #[serde(default)]
    pub required: bool,
}

/// A versioned `(action_type, registry_version)` → tool descriptor entry.
/// Immutable once written; versions are monotonically increasing per type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub action_type: String,
    pub registry_version: i64,
    pub tool_name: String,
    pub tool_schema_version: String,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    pub risk_class: RiskClass,
    pub compensation_strategy: CompensationStrategy,
    #[serde(default)]
    pub parameter_mapping: Vec<ParameterMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Execution attempt
// ---------------------------------------------------------------------------

/// The per-intent lock record. One item per `action_intent_id`; the status
/// transitions enforce exactly-once start and terminal monotonicity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub action_intent_id: String,
    pub tenant_id: String,
    pub account_id: String,
    pub status: AttemptStatus,
    pub attempt_count: i64,
    pub last_attempt_id: String,
    pub idempotency_key: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Execution trace: a fresh id per execution lifecycle, NOT the
    /// decision trace carried by the intent.
    pub trace_id: String,
    pub ttl_epoch: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_class: Option<String>,
}

// ---------------------------------------------------------------------------
// Action outcome
// ---------------------------------------------------------------------------

/// The immutable terminal record of one execution. Written once; a second
/// record call returns the existing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action_intent_id: String,
    pub tenant_id: String,
    pub account_id: String,
    pub status: OutcomeStatus,
    #[serde(default)]
    pub external_object_refs: Vec<ExternalObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub tool_name: String,
    pub tool_schema_version: String,
    pub registry_version: i64,
    pub tool_run_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response_artifact_ref: Option<String>,
    pub attempt_count: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub compensation_status: CompensationStatus,
    /// Execution trace.
    pub trace_id: String,
}

// ---------------------------------------------------------------------------
// Tenant execution policy (kill-switch config)
// ---------------------------------------------------------------------------

/// Per-tenant kill-switch configuration. A missing record means "enabled
/// with nothing disabled".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantExecutionPolicy {
    #[serde(default = "default_enabled")]
    pub execution_enabled: bool,
    #[serde(default)]
    pub disabled_action_types: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for TenantExecutionPolicy {
    fn default() -> Self {
        Self {
            execution_enabled: true,
            disabled_action_types: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
