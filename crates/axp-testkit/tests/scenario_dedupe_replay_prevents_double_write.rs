//! The adapter-layer choke-point: a rerun whose execution key already has a
//! recorded external write replays the refs from the dedupe store instead
//! of invoking the tool a second time.

use axp_schemas::{CompensationStrategy, OutcomeStatus, StartInput};
use axp_testkit::{make_intent, TestHarness};
use serde_json::json;

fn start_input() -> StartInput {
    StartInput {
        action_intent_id: "ai_1".to_string(),
        tenant_id: "t1".to_string(),
        account_id: "a1".to_string(),
    }
}

#[tokio::test]
async fn rerun_with_the_same_key_does_not_reinvoke_the_tool() {
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

    // First run succeeds (default scripted response carries one ref) and
    // records the external write under the execution key.
    let first = h.orchestrator.execute(start_input()).await.unwrap();
    assert_eq!(first.status, OutcomeStatus::Succeeded);
    assert_eq!(h.gateway.invocation_count(), 1);

    // Same intent, same parameters, same version: the rerun derives the
    // same execution key, so the gateway wrapper answers from the store.
    let handoff = h.orchestrator.start_rerun(start_input()).await.unwrap();
    let handoff = h.orchestrator.validate_preflight(handoff).await.unwrap();
    let envelope = h.orchestrator.map_action_to_tool(handoff).await.unwrap();
    let record_input = h.orchestrator.invoke_tool(envelope).await.unwrap();

    assert_eq!(h.gateway.invocation_count(), 1, "no second external write");
    assert!(record_input.success);
    assert_eq!(record_input.external_object_refs, first.external_object_refs);
    assert!(record_input.tool_run_ref.starts_with("deduped-"));
}

#[tokio::test]
async fn distinct_intents_with_identical_parameters_write_independently() {
    let h = TestHarness::new();
    for id in ["ai_1", "ai_2"] {
        h.seed_intent(&make_intent(
            id,
            "t1",
            "a1",
            "CREATE_CRM_TASK",
            json!({"title": "x"}),
            Some(1),
        ))
        .await;
    }
    h.seed_registry(
        "CREATE_CRM_TASK",
        "crm.create_task",
        &["title"],
        CompensationStrategy::Manual,
    )
    .await;

    for id in ["ai_1", "ai_2"] {
        let outcome = h
            .orchestrator
            .execute(StartInput {
                action_intent_id: id.to_string(),
                tenant_id: "t1".to_string(),
                account_id: "a1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Succeeded);
    }

    // Execution-layer keys include the intent id: two intents, two writes.
    assert_eq!(h.gateway.invocation_count(), 2);
}
