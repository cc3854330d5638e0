//! Compensation routing: a failed invocation that left side effects is
//! routed by strategy: PENDING for MANUAL and AUTOMATIC, COMPLETED ("not
//! supported") for NONE. Routing never throws.

use axp_schemas::{
    CompensationStatus, CompensationStrategy, ExternalObjectRef, OutcomeStatus, StartInput,
    ToolInvocationResponse,
};
use axp_testkit::{make_intent, TestHarness};
use serde_json::json;

fn failed_with_refs() -> ToolInvocationResponse {
    ToolInvocationResponse {
        success: false,
        external_object_refs: vec![ExternalObjectRef {
            system: "CRM".to_string(),
            object_type: "Task".to_string(),
            object_id: "T1".to_string(),
            object_url: None,
        }],
        tool_run_ref: "run_partial".to_string(),
        raw_response_artifact_ref: None,
        error_code: Some("CRM_TIMEOUT".to_string()),
        error_class: Some("TIMEOUT".to_string()),
        error_message: Some("write acknowledged, verification timed out".to_string()),
    }
}

async fn run_with_strategy(strategy: CompensationStrategy) -> axp_schemas::ActionOutcome {
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
    h.seed_registry("CREATE_CRM_TASK", "crm.create_task", &["title"], strategy)
        .await;
    h.gateway.push_response(failed_with_refs());

    h.orchestrator
        .execute(StartInput {
            action_intent_id: "ai_1".to_string(),
            tenant_id: "t1".to_string(),
            account_id: "a1".to_string(),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn automatic_strategy_routes_to_pending() {
    let outcome = run_with_strategy(CompensationStrategy::Automatic).await;
    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(outcome.compensation_status, CompensationStatus::Pending);
    // The side effect that needs compensating is recorded on the outcome.
    assert_eq!(outcome.external_object_refs.len(), 1);
}

#[tokio::test]
async fn manual_strategy_routes_to_pending() {
    let outcome = run_with_strategy(CompensationStrategy::Manual).await;
    assert_eq!(outcome.compensation_status, CompensationStatus::Pending);
}

#[tokio::test]
async fn no_strategy_skips_compensation() {
    let outcome = run_with_strategy(CompensationStrategy::None).await;
    assert_eq!(outcome.compensation_status, CompensationStatus::None);
}

#[tokio::test]
async fn failure_without_side_effects_skips_compensation() {
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
        CompensationStrategy::Automatic,
    )
    .await;
    h.gateway.push_response(ToolInvocationResponse {
        success: false,
        external_object_refs: vec![],
        tool_run_ref: "run_clean_fail".to_string(),
        raw_response_artifact_ref: None,
        error_code: None,
        error_class: Some("DOWNSTREAM".to_string()),
        error_message: Some("rejected before any write".to_string()),
    });

    let outcome = h
        .orchestrator
        .execute(StartInput {
            action_intent_id: "ai_1".to_string(),
            tenant_id: "t1".to_string(),
            account_id: "a1".to_string(),
        })
        .await
        .unwrap();

    // Nothing to undo: no refs, no compensation.
    assert_eq!(outcome.compensation_status, CompensationStatus::None);
}
