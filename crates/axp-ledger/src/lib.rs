//! Append-only execution event ledger.
//!
//! Every terminal transition in the pipeline appends a record here. Appends
//! are unique-per-call (fresh event id) and never mutated; there is no
//! ordering guarantee across writers; consumers correlate via the trace id
//! and timestamps.
//!
//! Appends are best-effort at the call sites the execution contract marks
//! as such: a ledger failure is logged and swallowed, it never breaks the
//! execution that produced it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use axp_store::{keys, Condition, IndexKey, IndexName, Item, KeyQuery, KvStore, StoreError};

// Event types appended by the orchestrator.
pub const EXECUTION_STARTED: &str = "EXECUTION_STARTED";
pub const ACTION_EXECUTED: &str = "ACTION_EXECUTED";
pub const ACTION_FAILED: &str = "ACTION_FAILED";
/// Sev-worthy: an idempotency key re-appeared with different side effects.
pub const IDEMPOTENCY_COLLISION: &str = "IDEMPOTENCY_COLLISION";

/// One immutable ledger record.
///
/// `trace_id` is the execution trace; `decision_trace_id` correlates back
/// to the proposal/approval phases when the intent was readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: Uuid,
    pub event_type: String,
    pub tenant_id: String,
    pub account_id: String,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_trace_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl EventRecord {
    pub fn new(
        event_type: &str,
        tenant_id: impl Into<String>,
        account_id: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            tenant_id: tenant_id.into(),
            account_id: account_id.into(),
            trace_id: trace_id.into(),
            decision_trace_id: None,
            timestamp: Utc::now(),
            data: Value::Object(Default::default()),
        }
    }

    pub fn with_decision_trace(mut self, decision_trace_id: impl Into<String>) -> Self {
        self.decision_trace_id = Some(decision_trace_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

pub struct EventLedger<S: KvStore> {
    store: S,
}

impl<S: KvStore> EventLedger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Append one record. The fresh event id makes the write unique per
    /// call, so the create-if-absent guard can only trip on a key bug.
    pub async fn append(&self, record: &EventRecord) -> Result<(), StoreError> {
        let ts_ms = record.timestamp.timestamp_millis();
        let event_id = record.event_id.to_string();

        let body = serde_json::to_value(record)
            .map_err(|e| StoreError::Backend(anyhow_from(e, "serialize event record")))?;

        let item = Item::new(
            keys::tenant_account_pk(&record.tenant_id, &record.account_id),
            keys::event_sk(ts_ms, &event_id),
            body,
        )
        .with_gsi1(IndexKey::new(
            keys::trace_pk(&record.trace_id),
            format!("{}#{event_id}", keys::timestamp_sk(ts_ms)),
        ))
        .with_gsi2(IndexKey::new(
            keys::tenant_pk(&record.tenant_id),
            format!("{}#{event_id}", keys::timestamp_sk(ts_ms)),
        ));

        self.store.put(item, Condition::Absent).await
    }

    /// Append, logging and swallowing any failure. This is the form every
    /// orchestrator call site uses: the ledger must never break execution.
    pub async fn append_best_effort(&self, record: &EventRecord) {
        if let Err(e) = self.append(record).await {
            warn!(
                event_type = %record.event_type,
                tenant_id = %record.tenant_id,
                trace_id = %record.trace_id,
                error = %e,
                "ledger append failed; continuing"
            );
        }
    }

    /// All records for one execution trace, in timestamp order.
    pub async fn events_for_trace(&self, trace_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        let page = self
            .store
            .query_index(IndexName::Gsi1, KeyQuery::partition(keys::trace_pk(trace_id)))
            .await?;
        decode_page(page.items)
    }

    /// Records for a tenant within `[from_ms, to_ms]`, capped at `limit`.
    pub async fn events_for_tenant_range(
        &self,
        tenant_id: &str,
        from_ms: i64,
        to_ms: i64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let page = self
            .store
            .query_index(
                IndexName::Gsi2,
                KeyQuery::partition(keys::tenant_pk(tenant_id)).prefix(keys::TIMESTAMP_PREFIX),
            )
            .await?;

        let mut out = Vec::new();
        for record in decode_page(page.items)? {
            let ts = record.timestamp.timestamp_millis();
            if ts < from_ms || ts > to_ms {
                continue;
            }
            out.push(record);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }
}

fn decode_page(items: Vec<Item>) -> Result<Vec<EventRecord>, StoreError> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let record: EventRecord = serde_json::from_value(item.body)
            .map_err(|e| StoreError::Backend(anyhow_from(e, "decode event record")))?;
        out.push(record);
    }
    Ok(out)
}

fn anyhow_from(e: impl std::error::Error + Send + Sync + 'static, what: &str) -> anyhow::Error {
    anyhow::Error::new(e).context(what.to_string())
}
