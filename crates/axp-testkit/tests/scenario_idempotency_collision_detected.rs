//! Adapter-layer dedupe: a recorded key replaying identical refs is silent;
//! the same key re-appearing with different refs is a collision alarm.

use axp_idempotency::IdempotencyError;
use axp_schemas::ExternalObjectRef;
use axp_testkit::TestHarness;

fn crm_task(id: &str) -> ExternalObjectRef {
    ExternalObjectRef {
        system: "CRM".to_string(),
        object_type: "Task".to_string(),
        object_id: id.to_string(),
        object_url: None,
    }
}

#[tokio::test]
async fn same_refs_replay_silently() {
    let h = TestHarness::new();
    let dedupe = h.dedupe();

    dedupe
        .record_external_write("idem-key", &[crm_task("T1")], "ai_1", "crm.create_task")
        .await
        .unwrap();
    dedupe
        .record_external_write("idem-key", &[crm_task("T1")], "ai_1", "crm.create_task")
        .await
        .unwrap();
}

#[tokio::test]
async fn different_refs_raise_a_collision() {
    let h = TestHarness::new();
    let dedupe = h.dedupe();

    dedupe
        .record_external_write("idem-key", &[crm_task("T1")], "ai_1", "crm.create_task")
        .await
        .unwrap();

    let err = dedupe
        .record_external_write("idem-key", &[crm_task("T2")], "ai_1", "crm.create_task")
        .await
        .unwrap_err();

    match err {
        IdempotencyError::Collision { key, existing, incoming } => {
            assert_eq!(key, "idem-key");
            assert_eq!(existing[0].object_id, "T1");
            assert_eq!(incoming[0].object_id, "T2");
        }
        other => panic!("expected collision, got {other:?}"),
    }

    // The original record is untouched.
    let recorded = dedupe.check_external_write("idem-key").await.unwrap().unwrap();
    assert_eq!(recorded.external_object_refs, vec![crm_task("T1")]);
}

#[tokio::test]
async fn reordered_refs_are_not_a_collision() {
    let h = TestHarness::new();
    let dedupe = h.dedupe();

    dedupe
        .record_external_write(
            "idem-key",
            &[crm_task("T1"), crm_task("T2")],
            "ai_1",
            "crm.create_task",
        )
        .await
        .unwrap();
    // Same set, different order: an idempotent replay.
    dedupe
        .record_external_write(
            "idem-key",
            &[crm_task("T2"), crm_task("T1")],
            "ai_1",
            "crm.create_task",
        )
        .await
        .unwrap();
}
