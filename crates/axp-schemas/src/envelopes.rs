//! Step envelopes exchanged between orchestration steps.
//!
//! Every envelope is a strict schema: unknown fields are rejected, except
//! where the orchestrator merges full state into the input (RecordOutcome
//! and RecordFailure accept extra keys).
//!
//! Events delivered through the bus replace absent fields with empty
//! strings, so the optional replay/approval fields get a preprocessing
//! layer: `""` and `null` are "absent", `"true"`/`"false"` are coerced for
//! booleans, and unrecognized strings become "absent".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{ApprovalSource, CompensationStrategy, ExternalObjectRef};

/// Upper bound on the serialized size of `tool_arguments`. Larger payloads
/// must be passed by artifact reference instead.
pub const TOOL_ARGUMENTS_MAX_BYTES: usize = 200 * 1024;

/// Envelope validation failure.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("tool_arguments must be a plain JSON object")]
    ToolArgumentsNotAnObject,
    #[error("tool_arguments too large: {bytes} bytes exceeds the {max}-byte limit; pass an artifact reference instead")]
    ToolArgumentsOversize { bytes: usize, max: usize },
}

/// `tool_arguments` must be a plain object within the size bound.
pub fn validate_tool_arguments(args: &Value) -> Result<(), EnvelopeError> {
    if !args.is_object() {
        return Err(EnvelopeError::ToolArgumentsNotAnObject);
    }
    // Compact serialization is the wire size the gateway sees.
    let bytes = serde_json::to_string(args).map(|s| s.len()).unwrap_or(0);
    if bytes > TOOL_ARGUMENTS_MAX_BYTES {
        return Err(EnvelopeError::ToolArgumentsOversize {
            bytes,
            max: TOOL_ARGUMENTS_MAX_BYTES,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Empty-string preprocessing
// ---------------------------------------------------------------------------

fn de_approval_source<'de, D>(d: D) -> Result<Option<ApprovalSource>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(d)?;
    Ok(match v {
        Some(Value::String(s)) => match s.as_str() {
            "HUMAN" => Some(ApprovalSource::Human),
            "POLICY" => Some(ApprovalSource::Policy),
            // "" and any unrecognized string mean "absent".
            _ => None,
        },
        _ => None,
    })
}

fn de_loose_bool<'de, D>(d: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(d)?;
    Ok(match v {
        Some(Value::Bool(b)) => Some(b),
        Some(Value::String(s)) => match s.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

/// The trigger event that starts an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartInput {
    pub action_intent_id: String,
    pub tenant_id: String,
    pub account_id: String,
}

// ---------------------------------------------------------------------------
// Start → Validate → Map handoff
// ---------------------------------------------------------------------------

/// State passed from Start to ValidatePreflight and on to MapActionToTool.
///
/// Start emits it with the replay/approval fields absent; the orchestration
/// runtime may fill them in between steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepHandoff {
    pub action_intent_id: String,
    pub tenant_id: String,
    pub account_id: String,
    /// Execution trace generated at Start.
    pub trace_id: String,
    pub idempotency_key: String,
    pub registry_version: i64,
    pub attempt_count: i64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_result: Option<Value>,
    #[serde(default, deserialize_with = "de_approval_source")]
    pub approval_source: Option<ApprovalSource>,
    #[serde(default, deserialize_with = "de_loose_bool")]
    pub auto_executed: Option<bool>,
}

// ---------------------------------------------------------------------------
// Map → Invoke
// ---------------------------------------------------------------------------

/// The invocation envelope handed to the tool gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvocationEnvelope {
    pub action_intent_id: String,
    pub tenant_id: String,
    pub account_id: String,
    pub trace_id: String,
    pub gateway_url: String,
    pub tool_name: String,
    /// Plain object, ≤ [`TOOL_ARGUMENTS_MAX_BYTES`] serialized. Carries the
    /// `idempotency_key` and `action_intent_id` for adapter-level dedupe.
    pub tool_arguments: Value,
    pub tool_schema_version: String,
    pub registry_version: i64,
    pub compensation_strategy: CompensationStrategy,
    pub idempotency_key: String,
    pub attempt_count: i64,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Invoke → Record
// ---------------------------------------------------------------------------

/// What the tool gateway returns. Extra gateway fields are tolerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationResponse {
    pub success: bool,
    #[serde(default)]
    pub external_object_refs: Vec<ExternalObjectRef>,
    pub tool_run_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response_artifact_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// RecordOutcome input: the invocation envelope merged with the tool
/// response. The orchestrator merges full state here, so unknown fields are
/// accepted; this is the one deliberately non-strict handoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordInput {
    pub action_intent_id: String,
    pub tenant_id: String,
    pub account_id: String,
    pub trace_id: String,
    pub tool_name: String,
    pub tool_schema_version: String,
    pub registry_version: i64,
    pub compensation_strategy: CompensationStrategy,
    pub idempotency_key: String,
    pub attempt_count: i64,
    pub started_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub external_object_refs: Vec<ExternalObjectRef>,
    pub tool_run_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response_artifact_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Filled by the compensation branch when it ran before recording.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_status: Option<crate::CompensationStatus>,
}

// ---------------------------------------------------------------------------
// RecordFailure
// ---------------------------------------------------------------------------

/// The error shape the orchestration runtime attaches to a failed step.
/// Field names follow the runtime's own convention, hence the casing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorShape {
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "Cause", default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// RecordFailure input: whatever state the failed step had, plus the error
/// shape. Unknown fields are accepted because the failed step's state varies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInput {
    pub action_intent_id: String,
    pub tenant_id: String,
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<ErrorShape>,
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start_input_rejects_unknown_fields() {
        let err = serde_json::from_value::<StartInput>(json!({
            "action_intent_id": "ai_1",
            "tenant_id": "t1",
            "account_id": "a1",
            "surprise": true,
        }));
        assert!(err.is_err());
    }

    #[test]
    fn handoff_treats_empty_strings_as_absent() {
        let h: StepHandoff = serde_json::from_value(json!({
            "action_intent_id": "ai_1",
            "tenant_id": "t1",
            "account_id": "a1",
            "trace_id": "exec-1",
            "idempotency_key": "k",
            "registry_version": 1,
            "attempt_count": 1,
            "started_at": "2026-01-05T00:00:00Z",
            "approval_source": "",
            "auto_executed": "",
        }))
        .unwrap();
        assert_eq!(h.approval_source, None);
        assert_eq!(h.auto_executed, None);
    }

    #[test]
    fn handoff_coerces_bool_strings() {
        let h: StepHandoff = serde_json::from_value(json!({
            "action_intent_id": "ai_1",
            "tenant_id": "t1",
            "account_id": "a1",
            "trace_id": "exec-1",
            "idempotency_key": "k",
            "registry_version": 1,
            "attempt_count": 1,
            "started_at": "2026-01-05T00:00:00Z",
            "approval_source": "HUMAN",
            "auto_executed": "true",
        }))
        .unwrap();
        assert_eq!(h.approval_source, Some(ApprovalSource::Human));
        assert_eq!(h.auto_executed, Some(true));
    }

    #[test]
    fn handoff_drops_unrecognized_approval_source() {
        let h: StepHandoff = serde_json::from_value(json!({
            "action_intent_id": "ai_1",
            "tenant_id": "t1",
            "account_id": "a1",
            "trace_id": "exec-1",
            "idempotency_key": "k",
            "registry_version": 1,
            "attempt_count": 1,
            "started_at": "2026-01-05T00:00:00Z",
            "approval_source": "ROBOT",
            "auto_executed": "maybe",
        }))
        .unwrap();
        assert_eq!(h.approval_source, None);
        assert_eq!(h.auto_executed, None);
    }

    #[test]
    fn tool_arguments_must_be_an_object() {
        assert!(matches!(
            validate_tool_arguments(&json!([1, 2, 3])),
            Err(EnvelopeError::ToolArgumentsNotAnObject)
        ));
        assert!(validate_tool_arguments(&json!({"a": 1})).is_ok());
    }

    #[test]
    fn tool_arguments_size_boundary() {
        // 199 KB passes; just over the 200 KB bound fails.
        let under = "x".repeat(199 * 1024);
        assert!(validate_tool_arguments(&json!({ "blob": under })).is_ok());

        let over = "x".repeat(201 * 1024);
        let err = validate_tool_arguments(&json!({ "blob": over })).unwrap_err();
        assert!(matches!(err, EnvelopeError::ToolArgumentsOversize { .. }));
    }

    #[test]
    fn record_input_accepts_extra_keys() {
        let r: RecordInput = serde_json::from_value(json!({
            "action_intent_id": "ai_1",
            "tenant_id": "t1",
            "account_id": "a1",
            "trace_id": "exec-1",
            "tool_name": "internal.create_task",
            "tool_schema_version": "1.0",
            "registry_version": 1,
            "compensation_strategy": "NONE",
            "idempotency_key": "k",
            "attempt_count": 1,
            "started_at": "2026-01-05T00:00:00Z",
            "success": true,
            "tool_run_ref": "run_1",
            "merged_orchestrator_state": {"anything": "goes"},
        }))
        .unwrap();
        assert!(r.success);
        assert_eq!(r.tool_run_ref, "run_1");
    }

    #[test]
    fn failure_error_shape_uses_runtime_casing() {
        let f: FailureInput = serde_json::from_value(json!({
            "action_intent_id": "ai_1",
            "tenant_id": "t1",
            "account_id": "a1",
            "error": {"Cause": "KILL_SWITCH_ACTIVE"},
        }))
        .unwrap();
        assert_eq!(f.error.unwrap().cause.as_deref(), Some("KILL_SWITCH_ACTIVE"));
    }
}
