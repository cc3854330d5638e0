//! Execution-attempt lock.
//!
//! # Invariants
//!
//! - **Exactly-once start**: the lock row is created with a conditional
//!   create; a second start while RUNNING fails with `AlreadyInProgress`.
//! - **No silent rerun**: a start on a terminal record is rejected unless
//!   `allow_rerun` is set; the normal-path safety net against duplicate
//!   delivery of start events.
//! - **Terminal monotonicity**: once terminal, the only legal transition is
//!   back to RUNNING via the explicit rerun update, itself guarded by
//!   `status IN {SUCCEEDED, FAILED, CANCELLED}`. Terminal → terminal is
//!   unrepresentable.
//!
//! Two condition expressions (create-if-absent and `status = RUNNING`)
//! together forbid every illegal transition: double starts, double
//! terminations, outcome overwrites, silent reruns.

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use axp_schemas::{AttemptStatus, ExecutionAttempt};
use axp_store::{keys, Condition, IndexKey, Item, KvStore, StoreError, Update};

/// Applied when the caller does not supply an orchestration timeout.
pub const DEFAULT_ORCHESTRATION_TIMEOUT_SECONDS: i64 = 3_600;

/// Terminal statuses accepted by [`AttemptStore::update_status`]. A distinct
/// type so a RUNNING target is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl TerminalStatus {
    pub fn as_attempt_status(&self) -> AttemptStatus {
        match self {
            TerminalStatus::Succeeded => AttemptStatus::Succeeded,
            TerminalStatus::Failed => AttemptStatus::Failed,
            TerminalStatus::Cancelled => AttemptStatus::Cancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.as_attempt_status().as_str()
    }
}

#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("execution already in progress for intent {action_intent_id}")]
    AlreadyInProgress { action_intent_id: String },
    #[error(
        "execution already completed for intent {action_intent_id} (status {status}); \
         rerun requires an explicit allow_rerun"
    )]
    AlreadyCompleted {
        action_intent_id: String,
        status: &'static str,
    },
    /// The record vanished between a failed conditional write and the
    /// follow-up read (TTL sweep or admin deletion). Surfaced distinctly;
    /// never silently retried.
    #[error("attempt record for intent {action_intent_id} disappeared mid-operation; raced a deletion")]
    RaceCondition { action_intent_id: String },
    /// Terminal transition attempted while the record is not RUNNING. A
    /// correctness alarm, not a retryable I/O error.
    #[error(
        "cannot transition intent {action_intent_id} to {target}: current status is {found} (not RUNNING)"
    )]
    InvalidTransition {
        action_intent_id: String,
        target: &'static str,
        found: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct StartAttemptArgs {
    pub action_intent_id: String,
    pub tenant_id: String,
    pub account_id: String,
    /// Fresh execution trace generated by the caller at Start.
    pub execution_trace_id: String,
    pub idempotency_key: String,
    pub orchestration_timeout_seconds: Option<i64>,
    pub allow_rerun: bool,
}

pub struct AttemptStore<S: KvStore> {
    store: S,
    ttl_buffer_seconds: i64,
}

impl<S: KvStore> AttemptStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            ttl_buffer_seconds: 900,
        }
    }

    /// Override the 15-minute TTL buffer added on top of the orchestration
    /// timeout (guards against mid-backoff TTL deletion).
    pub fn with_ttl_buffer_seconds(mut self, buffer: i64) -> Self {
        self.ttl_buffer_seconds = buffer;
        self
    }

    /// Acquire the exclusive RUNNING lock for an intent.
    pub async fn start_attempt(
        &self,
        args: StartAttemptArgs,
    ) -> Result<ExecutionAttempt, AttemptError> {
        let now = Utc::now();
        let timeout = args
            .orchestration_timeout_seconds
            .unwrap_or(DEFAULT_ORCHESTRATION_TIMEOUT_SECONDS);
        let ttl_epoch = now.timestamp() + timeout + self.ttl_buffer_seconds;
        let attempt_id = Uuid::new_v4().to_string();

        let attempt = ExecutionAttempt {
            action_intent_id: args.action_intent_id.clone(),
            tenant_id: args.tenant_id.clone(),
            account_id: args.account_id.clone(),
            status: AttemptStatus::Running,
            attempt_count: 1,
            last_attempt_id: attempt_id.clone(),
            idempotency_key: args.idempotency_key.clone(),
            started_at: now,
            updated_at: now,
            trace_id: args.execution_trace_id.clone(),
            ttl_epoch,
            last_error_class: None,
        };

        let pk = keys::tenant_account_pk(&args.tenant_id, &args.account_id);
        let sk = keys::execution_sk(&args.action_intent_id);
        let item = Item::new(&pk, &sk, encode(&attempt)?)
            .with_ttl(ttl_epoch)
            .with_gsi2(IndexKey::new(
                keys::tenant_pk(&args.tenant_id),
                keys::updated_at_sk(now.timestamp_millis()),
            ));

        match self.store.put(item, Condition::Absent).await {
            Ok(()) => return Ok(attempt),
            Err(StoreError::ConditionFailed) => {}
            Err(e) => return Err(e.into()),
        }

        // The create lost: inspect the existing record.
        let existing = match self.store.get(&pk, &sk).await? {
            Some(item) => decode(item)?,
            None => {
                return Err(AttemptError::RaceCondition {
                    action_intent_id: args.action_intent_id,
                })
            }
        };

        if existing.status == AttemptStatus::Running {
            return Err(AttemptError::AlreadyInProgress {
                action_intent_id: args.action_intent_id,
            });
        }
        if !args.allow_rerun {
            return Err(AttemptError::AlreadyCompleted {
                action_intent_id: args.action_intent_id,
                status: existing.status.as_str(),
            });
        }

        // Explicit rerun: terminal → RUNNING, guarded by the terminal set so
        // a concurrent rerun (or a racing start) cannot double-apply.
        let update = Update::default()
            .set("status", json!(AttemptStatus::Running))
            .set("attempt_count", json!(existing.attempt_count + 1))
            .set("last_attempt_id", json!(attempt_id))
            .set("idempotency_key", json!(args.idempotency_key))
            .set("started_at", json!(now))
            .set("updated_at", json!(now))
            .set("trace_id", json!(args.execution_trace_id))
            .set("ttl_epoch", json!(ttl_epoch))
            .remove("last_error_class")
            .ttl(ttl_epoch)
            .gsi2(IndexKey::new(
                keys::tenant_pk(&args.tenant_id),
                keys::updated_at_sk(now.timestamp_millis()),
            ));

        let cond = Condition::AttributeIn(
            "status".to_string(),
            vec![json!("SUCCEEDED"), json!("FAILED"), json!("CANCELLED")],
        );

        match self.store.update(&pk, &sk, update, cond).await {
            Ok(item) => decode(item),
            Err(StoreError::ConditionFailed) => Err(AttemptError::RaceCondition {
                action_intent_id: args.action_intent_id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// RUNNING → terminal transition, guarded by `status = RUNNING`.
    pub async fn update_status(
        &self,
        action_intent_id: &str,
        tenant_id: &str,
        account_id: &str,
        target: TerminalStatus,
        error_class: Option<&str>,
    ) -> Result<ExecutionAttempt, AttemptError> {
        let now = Utc::now();
        let pk = keys::tenant_account_pk(tenant_id, account_id);
        let sk = keys::execution_sk(action_intent_id);

        let mut update = Update::default()
            .set("status", json!(target.as_str()))
            .set("updated_at", json!(now))
            .gsi2(IndexKey::new(
                keys::tenant_pk(tenant_id),
                keys::updated_at_sk(now.timestamp_millis()),
            ));
        if let Some(class) = error_class {
            update = update.set("last_error_class", json!(class));
        }

        let cond = Condition::AttributeEquals("status".to_string(), json!("RUNNING"));

        match self.store.update(&pk, &sk, update, cond).await {
            Ok(item) => decode(item),
            Err(StoreError::ConditionFailed) => {
                let found = match self.store.get(&pk, &sk).await? {
                    Some(item) => decode(item)?.status.as_str().to_string(),
                    None => "<missing>".to_string(),
                };
                Err(AttemptError::InvalidTransition {
                    action_intent_id: action_intent_id.to_string(),
                    target: target.as_str(),
                    found,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_attempt(
        &self,
        action_intent_id: &str,
        tenant_id: &str,
        account_id: &str,
    ) -> Result<Option<ExecutionAttempt>, AttemptError> {
        let item = self
            .store
            .get(
                &keys::tenant_account_pk(tenant_id, account_id),
                &keys::execution_sk(action_intent_id),
            )
            .await?;
        match item {
            Some(item) => Ok(Some(decode(item)?)),
            None => Ok(None),
        }
    }
}

fn encode(attempt: &ExecutionAttempt) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(attempt)
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e).context("serialize attempt")))
}

fn decode(item: Item) -> Result<ExecutionAttempt, AttemptError> {
    serde_json::from_value(item.body)
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e).context("decode attempt")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axp_store::MemoryKvStore;
    use std::sync::Arc;

    fn args(intent: &str) -> StartAttemptArgs {
        StartAttemptArgs {
            action_intent_id: intent.to_string(),
            tenant_id: "t1".to_string(),
            account_id: "a1".to_string(),
            execution_trace_id: format!("exec-{intent}"),
            idempotency_key: "k1".to_string(),
            orchestration_timeout_seconds: None,
            allow_rerun: false,
        }
    }

    #[tokio::test]
    async fn first_start_creates_a_running_attempt() {
        let store = AttemptStore::new(MemoryKvStore::new());
        let attempt = store.start_attempt(args("ai_1")).await.unwrap();
        assert_eq!(attempt.status, AttemptStatus::Running);
        assert_eq!(attempt.attempt_count, 1);
        assert!(!attempt.last_attempt_id.is_empty());
    }

    #[tokio::test]
    async fn ttl_exceeds_timeout_by_the_buffer() {
        let store = AttemptStore::new(MemoryKvStore::new());
        let mut a = args("ai_1");
        a.orchestration_timeout_seconds = Some(600);
        let before = Utc::now().timestamp();
        let attempt = store.start_attempt(a).await.unwrap();
        assert!(attempt.ttl_epoch >= before + 600 + 900);
        assert!(attempt.ttl_epoch <= Utc::now().timestamp() + 600 + 900 + 5);
    }

    #[tokio::test]
    async fn second_start_while_running_is_rejected() {
        let store = AttemptStore::new(MemoryKvStore::new());
        store.start_attempt(args("ai_1")).await.unwrap();

        let err = store.start_attempt(args("ai_1")).await.unwrap_err();
        assert!(matches!(err, AttemptError::AlreadyInProgress { .. }));
        assert!(err.to_string().contains("already in progress"));
    }

    #[tokio::test]
    async fn start_on_terminal_without_rerun_is_rejected() {
        let store = AttemptStore::new(MemoryKvStore::new());
        store.start_attempt(args("ai_1")).await.unwrap();
        store
            .update_status("ai_1", "t1", "a1", TerminalStatus::Succeeded, None)
            .await
            .unwrap();

        let err = store.start_attempt(args("ai_1")).await.unwrap_err();
        assert!(matches!(err, AttemptError::AlreadyCompleted { .. }));
    }

    #[tokio::test]
    async fn rerun_increments_count_and_clears_error_class() {
        let store = AttemptStore::new(MemoryKvStore::new());
        store.start_attempt(args("ai_1")).await.unwrap();
        store
            .update_status("ai_1", "t1", "a1", TerminalStatus::Failed, Some("DOWNSTREAM"))
            .await
            .unwrap();

        let mut rerun = args("ai_1");
        rerun.allow_rerun = true;
        rerun.idempotency_key = "k2".to_string();
        rerun.execution_trace_id = "exec-rerun".to_string();

        let attempt = store.start_attempt(rerun).await.unwrap();
        assert_eq!(attempt.status, AttemptStatus::Running);
        assert_eq!(attempt.attempt_count, 2);
        assert_eq!(attempt.idempotency_key, "k2");
        assert_eq!(attempt.trace_id, "exec-rerun");
        assert_eq!(attempt.last_error_class, None);
    }

    #[tokio::test]
    async fn double_termination_is_a_correctness_alarm() {
        let store = AttemptStore::new(MemoryKvStore::new());
        store.start_attempt(args("ai_1")).await.unwrap();
        store
            .update_status("ai_1", "t1", "a1", TerminalStatus::Succeeded, None)
            .await
            .unwrap();

        let err = store
            .update_status("ai_1", "t1", "a1", TerminalStatus::Failed, None)
            .await
            .unwrap_err();
        match err {
            AttemptError::InvalidTransition { target, found, .. } => {
                assert_eq!(target, "FAILED");
                assert_eq!(found, "SUCCEEDED");
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_follows_the_same_terminal_rule() {
        let store = AttemptStore::new(MemoryKvStore::new());
        store.start_attempt(args("ai_1")).await.unwrap();
        let attempt = store
            .update_status("ai_1", "t1", "a1", TerminalStatus::Cancelled, None)
            .await
            .unwrap();
        assert_eq!(attempt.status, AttemptStatus::Cancelled);

        // CANCELLED is terminal like any other: no second transition.
        let err = store
            .update_status("ai_1", "t1", "a1", TerminalStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AttemptError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn terminal_transition_records_error_class() {
        let store = AttemptStore::new(MemoryKvStore::new());
        store.start_attempt(args("ai_1")).await.unwrap();
        let attempt = store
            .update_status("ai_1", "t1", "a1", TerminalStatus::Failed, Some("TIMEOUT"))
            .await
            .unwrap();
        assert_eq!(attempt.last_error_class.as_deref(), Some("TIMEOUT"));
    }

    #[tokio::test]
    async fn vanished_record_surfaces_as_race_condition() {
        let kv = Arc::new(MemoryKvStore::new());
        let store = AttemptStore::new(kv.clone());
        store.start_attempt(args("ai_1")).await.unwrap();

        // TTL sweep between the failed create and the follow-up read is
        // indistinguishable from an admin delete; simulate via update_status
        // against a record deleted after its condition check would re-read.
        kv.expire_now("TENANT#t1#ACCOUNT#a1", "EXECUTION#ai_1").await;
        let err = store
            .update_status("ai_1", "t1", "a1", TerminalStatus::Succeeded, None)
            .await
            .unwrap_err();
        match err {
            AttemptError::InvalidTransition { found, .. } => assert_eq!(found, "<missing>"),
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
    }
}
