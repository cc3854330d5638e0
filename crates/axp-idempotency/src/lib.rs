//! Dual-layer idempotency: canonical hashing and the adapter-layer dedupe
//! store.
//!
//! The execution-layer key binds `(tenant, intent, tool, params, registry
//! version)`: distinct intents with identical parameters hash differently,
//! replays of the same intent hash identically. The semantic key drops the
//! intent id for the "never double-write externally across duplicate
//! intents" policy; default wiring dedupes on the execution-layer key.
//!
//! The dedupe store keeps two item families per key: immutable history
//! items (`CREATED_AT#<epoch_ms>`, the source of truth) and one best-effort
//! `LATEST` pointer. The pointer is reconstructible from history and its
//! write failures are tolerated.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, warn};

use axp_schemas::{refs_equal, ExternalObjectRef};
use axp_store::{keys, Condition, Item, KeyQuery, KvStore, StoreError};

// ---------------------------------------------------------------------------
// Canonicalization
// ---------------------------------------------------------------------------

/// Canonical form: object keys sorted recursively, array order preserved
/// (order-sensitive by design), null preserved. Serialized exactly once at
/// the end, yielding a single byte sequence per semantic value.
pub fn canonicalize(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), canonicalize(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize).collect()),
        _ => v.clone(),
    }
}

/// The single serialization of the canonical form.
pub fn canonical_string(v: &Value) -> String {
    serde_json::to_string(&canonicalize(v)).expect("json serialization must not fail")
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Execution-layer key: scoped to one intent.
pub fn execution_key(
    tenant_id: &str,
    action_intent_id: &str,
    tool_name: &str,
    params: &Value,
    registry_version: i64,
) -> String {
    let canon = canonical_string(params);
    sha256_hex(&format!(
        "{tenant_id}|{action_intent_id}|{tool_name}|{canon}|{registry_version}"
    ))
}

/// Semantic key: same derivation minus the intent id, so duplicate intents
/// carrying identical parameters collide on purpose.
pub fn semantic_key(
    tenant_id: &str,
    tool_name: &str,
    params: &Value,
    registry_version: i64,
) -> String {
    let canon = canonical_string(params);
    sha256_hex(&format!("{tenant_id}|{tool_name}|{canon}|{registry_version}"))
}

// ---------------------------------------------------------------------------
// Dedupe store
// ---------------------------------------------------------------------------

/// One recorded external write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedWrite {
    #[serde(default)]
    pub external_object_refs: Vec<ExternalObjectRef>,
    pub action_intent_id: String,
    pub tool_name: String,
    pub created_at_epoch_ms: i64,
}

/// LATEST pointer body: a copy of the newest write plus the sort key of the
/// history item it mirrors.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LatestPointer {
    #[serde(flatten)]
    write: RecordedWrite,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    latest_sk: Option<String>,
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// The key re-appeared with a different external ref set. Sev-worthy:
    /// the caller must emit a ledger record, structured log, and metric.
    /// Never retried.
    #[error("idempotency collision on key {key}: recorded external refs differ from the write being recorded")]
    Collision {
        key: String,
        existing: Vec<ExternalObjectRef>,
        incoming: Vec<ExternalObjectRef>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct DedupeStore<S: KvStore> {
    store: S,
    retention_days: i64,
}

impl<S: KvStore> DedupeStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            retention_days: 7,
        }
    }

    pub fn with_retention_days(mut self, retention_days: i64) -> Self {
        self.retention_days = retention_days;
        self
    }

    /// Look up the recorded write for a key, if any.
    ///
    /// The LATEST pointer is consulted first as an optimization; the
    /// descending history query is the source of truth and covers a
    /// missing or dangling pointer.
    pub async fn check_external_write(
        &self,
        key: &str,
    ) -> Result<Option<RecordedWrite>, StoreError> {
        let pk = keys::idempotency_pk(key);

        if let Some(item) = self.store.get(&pk, keys::DEDUPE_LATEST_SK).await? {
            if let Ok(pointer) = serde_json::from_value::<LatestPointer>(item.body) {
                match &pointer.latest_sk {
                    Some(sk) => {
                        if let Some(history) = self.store.get(&pk, sk).await? {
                            if let Ok(write) = serde_json::from_value(history.body) {
                                return Ok(Some(write));
                            }
                        }
                        // Dangling pointer: fall through to history.
                    }
                    None => return Ok(Some(pointer.write)),
                }
            }
        }

        let page = self
            .store
            .query(
                KeyQuery::partition(&pk)
                    .prefix(keys::DEDUPE_HISTORY_PREFIX)
                    .descending()
                    .limit(1),
            )
            .await?;

        match page.items.into_iter().next() {
            Some(item) => {
                let write = serde_json::from_value(item.body).map_err(|e| {
                    StoreError::Backend(anyhow::Error::new(e).context("decode dedupe history"))
                })?;
                Ok(Some(write))
            }
            None => Ok(None),
        }
    }

    /// Record an external write under a key.
    ///
    /// - Same refs already recorded: silent success (idempotent replay).
    /// - Different refs recorded: [`IdempotencyError::Collision`].
    /// - Nothing recorded: write the immutable history item, then the
    ///   best-effort LATEST pointer (same TTL; failure tolerated).
    pub async fn record_external_write(
        &self,
        key: &str,
        refs: &[ExternalObjectRef],
        action_intent_id: &str,
        tool_name: &str,
    ) -> Result<(), IdempotencyError> {
        if let Some(existing) = self.check_external_write(key).await? {
            return self.compare_existing(key, existing, refs);
        }

        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let ttl_epoch = now.timestamp() + self.retention_days * 86_400;

        let write = RecordedWrite {
            external_object_refs: refs.to_vec(),
            action_intent_id: action_intent_id.to_string(),
            tool_name: tool_name.to_string(),
            created_at_epoch_ms: now_ms,
        };

        let pk = keys::idempotency_pk(key);
        let history_sk = keys::dedupe_history_sk(now_ms);
        let body = serde_json::to_value(&write).map_err(|e| {
            StoreError::Backend(anyhow::Error::new(e).context("serialize dedupe history"))
        })?;

        match self
            .store
            .put(
                Item::new(&pk, &history_sk, body).with_ttl(ttl_epoch),
                Condition::Absent,
            )
            .await
        {
            Ok(()) => {}
            Err(StoreError::ConditionFailed) => {
                // Lost a same-millisecond race; defer to whatever landed.
                match self.check_external_write(key).await? {
                    Some(existing) => return self.compare_existing(key, existing, refs),
                    None => return Err(StoreError::ConditionFailed.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }

        // Best-effort pointer: history already won, a pointer failure only
        // costs the read optimization.
        let pointer = LatestPointer {
            write,
            latest_sk: Some(history_sk),
        };
        let pointer_body = match serde_json::to_value(&pointer) {
            Ok(b) => b,
            Err(e) => {
                warn!(key, error = %e, "LATEST pointer serialize failed; history stands");
                return Ok(());
            }
        };
        if let Err(e) = self
            .store
            .put(
                Item::new(&pk, keys::DEDUPE_LATEST_SK, pointer_body).with_ttl(ttl_epoch),
                Condition::None,
            )
            .await
        {
            warn!(key, error = %e, "LATEST pointer write failed; history stands");
        }

        Ok(())
    }

    fn compare_existing(
        &self,
        key: &str,
        existing: RecordedWrite,
        incoming: &[ExternalObjectRef],
    ) -> Result<(), IdempotencyError> {
        if refs_equal(&existing.external_object_refs, incoming) {
            return Ok(());
        }
        error!(
            key,
            recorded_intent = %existing.action_intent_id,
            recorded_tool = %existing.tool_name,
            "idempotency collision: key re-appeared with different external refs"
        );
        Err(IdempotencyError::Collision {
            key: key.to_string(),
            existing: existing.external_object_refs,
            incoming: incoming.to_vec(),
        })
    }
}
