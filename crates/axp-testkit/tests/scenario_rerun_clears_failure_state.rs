//! Controlled rerun: only the explicit allow_rerun path may take a
//! terminal attempt back to RUNNING, incrementing the count by exactly one
//! and clearing the recorded error class.

use axp_schemas::{
    AttemptStatus, CompensationStrategy, OutcomeStatus, StartInput, ToolInvocationResponse,
};
use axp_testkit::{make_intent, TestHarness};
use serde_json::json;

fn start_input() -> StartInput {
    StartInput {
        action_intent_id: "ai_1".to_string(),
        tenant_id: "t1".to_string(),
        account_id: "a1".to_string(),
    }
}

fn failed_response() -> ToolInvocationResponse {
    ToolInvocationResponse {
        success: false,
        external_object_refs: vec![],
        tool_run_ref: "run_fail".to_string(),
        raw_response_artifact_ref: None,
        error_code: Some("CRM_503".to_string()),
        error_class: Some("DOWNSTREAM".to_string()),
        error_message: Some("crm unavailable".to_string()),
    }
}

async fn seeded_harness() -> TestHarness {
    let h = TestHarness::new();
    h.seed_intent(&make_intent(
        "ai_1",
        "t1",
        "a1",
        "CREATE_CRM_TASK",
        json!({"title": "x"}),
        Some(1),
    ))
    .await;
    h.seed_registry(
        "CREATE_CRM_TASK",
        "crm.create_task",
        &["title"],
        CompensationStrategy::Manual,
    )
    .await;
    h
}

#[tokio::test]
async fn failed_execution_records_the_error_class_on_the_attempt() {
    let h = seeded_harness().await;
    h.gateway.push_response(failed_response());

    let outcome = h.orchestrator.execute(start_input()).await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Failed);
    // In-tool failures preserve the adapter's classification unchanged.
    assert_eq!(outcome.error_class.as_deref(), Some("DOWNSTREAM"));
    assert_eq!(outcome.error_code.as_deref(), Some("CRM_503"));

    let attempt = h
        .attempts()
        .get_attempt("ai_1", "t1", "a1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert_eq!(attempt.last_error_class.as_deref(), Some("DOWNSTREAM"));
}

#[tokio::test]
async fn rerun_reopens_the_lock_with_a_fresh_trace() {
    let h = seeded_harness().await;
    h.gateway.push_response(failed_response());

    h.orchestrator.execute(start_input()).await.unwrap();
    let failed_attempt = h
        .attempts()
        .get_attempt("ai_1", "t1", "a1")
        .await
        .unwrap()
        .unwrap();

    let handoff = h.orchestrator.start_rerun(start_input()).await.unwrap();
    assert_eq!(handoff.attempt_count, 2);

    let rerun_attempt = h
        .attempts()
        .get_attempt("ai_1", "t1", "a1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rerun_attempt.status, AttemptStatus::Running);
    assert_eq!(rerun_attempt.attempt_count, 2);
    assert_eq!(rerun_attempt.last_error_class, None, "rerun clears the error class");
    assert_ne!(rerun_attempt.trace_id, failed_attempt.trace_id);
    assert_ne!(rerun_attempt.last_attempt_id, failed_attempt.last_attempt_id);
}

#[tokio::test]
async fn plain_start_cannot_reopen_a_terminal_attempt() {
    let h = seeded_harness().await;
    h.gateway.push_response(failed_response());

    h.orchestrator.execute(start_input()).await.unwrap();
    let err = h.orchestrator.start(start_input()).await.unwrap_err();
    assert!(err.to_string().contains("allow_rerun"));
}
