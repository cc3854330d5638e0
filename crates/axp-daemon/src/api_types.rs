//! Response payloads for the status API.

use chrono::{DateTime, Utc};
use serde::Serialize;

use axp_schemas::{AttemptStatus, ExecutionStatus, ExternalObjectRef, OutcomeStatus};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

/// Single-execution status. Resolution precedence is outcome > attempt >
/// intent; `RETRYING` never leaves the service (collapsed to `RUNNING`).
#[derive(Debug, Serialize)]
pub struct ExecutionStatusResponse {
    pub action_intent_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_object_refs: Option<Vec<ExternalObjectRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_count: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct OutcomeSummary {
    pub action_intent_id: String,
    pub status: ExecutionStatus,
    pub tool_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub attempt_count: i64,
}

#[derive(Debug, Serialize)]
pub struct ExecutionListResponse {
    pub items: Vec<OutcomeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

/// Collapse an outcome status for the API surface.
pub fn collapse_outcome_status(status: OutcomeStatus) -> ExecutionStatus {
    match status {
        OutcomeStatus::Succeeded => ExecutionStatus::Succeeded,
        OutcomeStatus::Failed => ExecutionStatus::Failed,
        OutcomeStatus::Cancelled => ExecutionStatus::Cancelled,
        // Mid-retry is still "running" as far as callers are concerned.
        OutcomeStatus::Retrying => ExecutionStatus::Running,
    }
}

pub fn attempt_status_to_api(status: AttemptStatus) -> ExecutionStatus {
    match status {
        AttemptStatus::Running => ExecutionStatus::Running,
        AttemptStatus::Succeeded => ExecutionStatus::Succeeded,
        AttemptStatus::Failed => ExecutionStatus::Failed,
        AttemptStatus::Cancelled => ExecutionStatus::Cancelled,
    }
}
