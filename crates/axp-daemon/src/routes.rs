//! Axum router and all HTTP handlers for axp-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. Handlers are `pub(crate)` so the scenario
//! tests in `tests/` can compose the router directly.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use axp_execution::OutcomeError;

use crate::{
    api_types::{
        attempt_status_to_api, collapse_outcome_status, ErrorResponse, ExecutionListResponse,
        ExecutionStatusResponse, HealthResponse, OutcomeSummary,
    },
    claims::TenantClaims,
    state::AppState,
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/executions/:intent_id/status", get(execution_status))
        .route("/v1/accounts/:account_id/executions", get(list_executions))
        .with_state(state)
}

fn bad_request(msg: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: msg.to_string(),
        }),
    )
        .into_response()
}

fn forbidden() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(ErrorResponse {
            error: "account not covered by caller claims".to_string(),
        }),
    )
        .into_response()
}

fn internal(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: format!("store error: {err}"),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/executions/{intent_id}/status
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct StatusParams {
    account_id: Option<String>,
}

pub(crate) async fn execution_status(
    claims: TenantClaims,
    State(st): State<Arc<AppState>>,
    Path(intent_id): Path<String>,
    Query(params): Query<StatusParams>,
) -> Response {
    let Some(account_id) = params.account_id else {
        return bad_request("account_id query parameter is required");
    };
    if !claims.allows_account(&account_id) {
        return forbidden();
    }
    let tenant_id = &claims.tenant_id;

    // Precedence: outcome > attempt > intent.
    match st.outcomes.get(&intent_id, tenant_id, &account_id).await {
        Ok(Some(outcome)) => {
            return (
                StatusCode::OK,
                Json(ExecutionStatusResponse {
                    action_intent_id: outcome.action_intent_id,
                    status: collapse_outcome_status(outcome.status),
                    started_at: Some(outcome.started_at),
                    completed_at: Some(outcome.completed_at),
                    external_object_refs: Some(outcome.external_object_refs),
                    error_message: outcome.error_message,
                    error_class: outcome.error_class,
                    attempt_count: Some(outcome.attempt_count),
                }),
            )
                .into_response();
        }
        Ok(None) => {}
        Err(e) => return internal(e),
    }

    match st.attempts.get_attempt(&intent_id, tenant_id, &account_id).await {
        Ok(Some(attempt)) => {
            return (
                StatusCode::OK,
                Json(ExecutionStatusResponse {
                    action_intent_id: attempt.action_intent_id,
                    status: attempt_status_to_api(attempt.status),
                    started_at: Some(attempt.started_at),
                    completed_at: None,
                    external_object_refs: None,
                    error_message: None,
                    error_class: attempt.last_error_class,
                    attempt_count: Some(attempt.attempt_count),
                }),
            )
                .into_response();
        }
        Ok(None) => {}
        Err(e) => return internal(e),
    }

    match st.intents.get(&intent_id, tenant_id, &account_id).await {
        Ok(Some(intent)) => {
            let status = if intent.is_expired(Utc::now().timestamp()) {
                axp_schemas::ExecutionStatus::Expired
            } else {
                axp_schemas::ExecutionStatus::Pending
            };
            (
                StatusCode::OK,
                Json(ExecutionStatusResponse {
                    action_intent_id: intent.action_intent_id,
                    status,
                    started_at: None,
                    completed_at: None,
                    external_object_refs: None,
                    error_message: None,
                    error_class: None,
                    attempt_count: None,
                }),
            )
                .into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no execution state for intent {intent_id}"),
            }),
        )
            .into_response(),
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/accounts/{account_id}/executions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct ListParams {
    limit: Option<i64>,
    next_token: Option<String>,
}

pub(crate) async fn list_executions(
    claims: TenantClaims,
    State(st): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Query(params): Query<ListParams>,
) -> Response {
    let limit = params.limit.unwrap_or(50);
    if !(1..=100).contains(&limit) {
        return bad_request("limit must be between 1 and 100");
    }
    if !claims.allows_account(&account_id) {
        return forbidden();
    }

    let result = st
        .outcomes
        .list(&claims.tenant_id, &account_id, limit, params.next_token.as_deref())
        .await;

    match result {
        Ok((outcomes, next_token)) => {
            info!(
                tenant_id = %claims.tenant_id,
                account_id = %account_id,
                count = outcomes.len(),
                "executions listed"
            );
            let items = outcomes
                .into_iter()
                .map(|o| OutcomeSummary {
                    action_intent_id: o.action_intent_id,
                    status: collapse_outcome_status(o.status),
                    tool_name: o.tool_name,
                    started_at: o.started_at,
                    completed_at: o.completed_at,
                    error_class: o.error_class,
                    error_message: o.error_message,
                    attempt_count: o.attempt_count,
                })
                .collect();
            (
                StatusCode::OK,
                Json(ExecutionListResponse { items, next_token }),
            )
                .into_response()
        }
        Err(OutcomeError::InvalidToken) => bad_request("invalid next_token"),
        Err(e) => internal(e),
    }
}
