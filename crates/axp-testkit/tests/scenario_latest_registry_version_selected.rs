//! Deterministic tool selection: "latest" is the numerically highest
//! version, and an intent pinned to a version keeps using it after newer
//! registrations.

use axp_schemas::{CompensationStrategy, OutcomeStatus, StartInput};
use axp_testkit::{make_intent, TestHarness};
use serde_json::json;

#[tokio::test]
async fn latest_returns_the_highest_version() {
    let h = TestHarness::new();
    let v1 = h
        .seed_registry("CREATE_CRM_TASK", "crm.create_task", &["title"], CompensationStrategy::Manual)
        .await;
    let v2 = h
        .seed_registry("CREATE_CRM_TASK", "crm.create_task_v2", &["title"], CompensationStrategy::Manual)
        .await;
    assert_eq!((v1, v2), (1, 2));

    let latest = h.registry().get_mapping("CREATE_CRM_TASK", None).await.unwrap().unwrap();
    assert_eq!(latest.registry_version, 2);
    assert_eq!(latest.tool_name, "crm.create_task_v2");

    let pinned = h.registry().get_mapping("CREATE_CRM_TASK", Some(1)).await.unwrap().unwrap();
    assert_eq!(pinned.registry_version, 1);
    assert_eq!(pinned.tool_name, "crm.create_task");
}

#[tokio::test]
async fn execution_is_pinned_to_the_intent_version() {
    let h = TestHarness::new();
    h.seed_registry("CREATE_CRM_TASK", "crm.create_task", &["title"], CompensationStrategy::Manual)
        .await;
    h.seed_registry("CREATE_CRM_TASK", "crm.create_task_v2", &["title"], CompensationStrategy::Manual)
        .await;

    // Approved against version 1; version 2 exists and must not be used.
    h.seed_intent(&make_intent(
        "ai_1",
        "t1",
        "a1",
        "CREATE_CRM_TASK",
        json!({"title": "x"}),
        Some(1),
    ))
    .await;

    let outcome = h
        .orchestrator
        .execute(StartInput {
            action_intent_id: "ai_1".to_string(),
            tenant_id: "t1".to_string(),
            account_id: "a1".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Succeeded);
    assert_eq!(outcome.registry_version, 1);
    assert_eq!(outcome.tool_name, "crm.create_task");
    assert_eq!(h.gateway.invocations()[0].tool_name, "crm.create_task");
}

#[tokio::test]
async fn version_without_entry_is_a_mapping_validation_failure() {
    let h = TestHarness::new();
    h.seed_registry("CREATE_CRM_TASK", "crm.create_task", &["title"], CompensationStrategy::Manual)
        .await;

    h.seed_intent(&make_intent(
        "ai_1",
        "t1",
        "a1",
        "CREATE_CRM_TASK",
        json!({"title": "x"}),
        Some(9),
    ))
    .await;

    let outcome = h
        .orchestrator
        .execute(StartInput {
            action_intent_id: "ai_1".to_string(),
            tenant_id: "t1".to_string(),
            account_id: "a1".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(outcome.error_class.as_deref(), Some("VALIDATION"));
    assert!(outcome
        .error_message
        .as_deref()
        .unwrap()
        .contains("TOOL_MAPPING_NOT_FOUND"));
    assert_eq!(h.gateway.invocation_count(), 0);
}
