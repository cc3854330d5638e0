//! Happy path: one intent becomes exactly one successful tool invocation,
//! one RUNNING→SUCCEEDED attempt, one outcome, and a correlated ledger trail.

use axp_ledger::{ACTION_EXECUTED, EXECUTION_STARTED};
use axp_schemas::{
    AttemptStatus, CompensationStrategy, OutcomeStatus, StartInput, ToolInvocationResponse,
};
use axp_testkit::{make_intent, TestHarness, GATEWAY_URL};
use serde_json::json;

fn start_input() -> StartInput {
    StartInput {
        action_intent_id: "ai_1".to_string(),
        tenant_id: "t1".to_string(),
        account_id: "a1".to_string(),
    }
}

async fn seeded_harness() -> TestHarness {
    let h = TestHarness::new();
    h.seed_intent(&make_intent(
        "ai_1",
        "t1",
        "a1",
        "CREATE_INTERNAL_TASK",
        json!({"title": "x", "description": "y"}),
        Some(1),
    ))
    .await;
    let version = h
        .seed_registry(
            "CREATE_INTERNAL_TASK",
            "internal.create_task",
            &["title", "description"],
            CompensationStrategy::Automatic,
        )
        .await;
    assert_eq!(version, 1);
    h
}

#[tokio::test]
async fn start_takes_the_lock_and_derives_the_key() {
    let h = seeded_harness().await;

    let handoff = h.orchestrator.start(start_input()).await.unwrap();

    assert_eq!(handoff.attempt_count, 1);
    assert_eq!(handoff.registry_version, 1);
    // Hex SHA-256 execution key.
    assert_eq!(handoff.idempotency_key.len(), 64);
    assert!(handoff.idempotency_key.chars().all(|c| c.is_ascii_hexdigit()));
    // Execution trace is fresh, not the decision trace.
    assert_ne!(handoff.trace_id, "decision-ai_1");

    let attempt = h
        .attempts()
        .get_attempt("ai_1", "t1", "a1")
        .await
        .unwrap()
        .expect("lock row");
    assert_eq!(attempt.status, AttemptStatus::Running);
    assert_eq!(attempt.idempotency_key, handoff.idempotency_key);
}

#[tokio::test]
async fn stepwise_drive_records_succeeded_everywhere() {
    let h = seeded_harness().await;
    h.gateway.push_response(ToolInvocationResponse {
        success: true,
        external_object_refs: vec![],
        tool_run_ref: "run_1".to_string(),
        raw_response_artifact_ref: None,
        error_code: None,
        error_class: None,
        error_message: None,
    });

    let handoff = h.orchestrator.start(start_input()).await.unwrap();
    let handoff = h.orchestrator.validate_preflight(handoff).await.unwrap();
    let envelope = h.orchestrator.map_action_to_tool(handoff).await.unwrap();

    assert_eq!(envelope.gateway_url, GATEWAY_URL);
    assert_eq!(envelope.tool_name, "internal.create_task");
    assert_eq!(envelope.compensation_strategy, CompensationStrategy::Automatic);
    // Adapter dedupe fields ride inside the tool arguments.
    assert_eq!(
        envelope.tool_arguments.get("idempotency_key").and_then(|v| v.as_str()),
        Some(envelope.idempotency_key.as_str())
    );
    assert_eq!(
        envelope.tool_arguments.get("action_intent_id").and_then(|v| v.as_str()),
        Some("ai_1")
    );
    assert_eq!(
        envelope.tool_arguments.get("title").and_then(|v| v.as_str()),
        Some("x")
    );

    let record_input = h.orchestrator.invoke_tool(envelope).await.unwrap();
    assert!(record_input.success);
    assert_eq!(record_input.tool_run_ref, "run_1");

    let trace_id = record_input.trace_id.clone();
    let outcome = h.orchestrator.record_outcome(record_input).await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Succeeded);

    let attempt = h
        .attempts()
        .get_attempt("ai_1", "t1", "a1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, AttemptStatus::Succeeded);

    // Ledger: EXECUTION_STARTED and ACTION_EXECUTED on the execution trace,
    // with the decision trace carried for correlation.
    let events = h.ledger().events_for_trace(&trace_id).await.unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&EXECUTION_STARTED));
    assert!(types.contains(&ACTION_EXECUTED));
    let executed = events.iter().find(|e| e.event_type == ACTION_EXECUTED).unwrap();
    assert_eq!(executed.decision_trace_id.as_deref(), Some("decision-ai_1"));
}

#[tokio::test]
async fn driver_runs_the_whole_pipeline_once() {
    let h = seeded_harness().await;

    let outcome = h.orchestrator.execute(start_input()).await.unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Succeeded);
    assert_eq!(outcome.attempt_count, 1);
    assert_eq!(h.gateway.invocation_count(), 1);
    // A success emits latency + success counters.
    assert_eq!(h.metrics.count_named("tool_latency_ms"), 1);
    assert_eq!(h.metrics.count_named("tool_success"), 1);
}
