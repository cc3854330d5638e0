//! Write-once outcome store.
//!
//! A terminal record is created exactly once with a conditional create; on
//! `ConditionFailed` the existing record is re-read and returned. Callers
//! cannot tell "I wrote it" from "I discovered it", which is the natural
//! idempotency the record-outcome step relies on.

use base64::Engine;
use thiserror::Error;

use axp_schemas::ActionOutcome;
use axp_store::{keys, Condition, IndexKey, Item, KeyQuery, KvStore, StoreError};

#[derive(Debug, Error)]
pub enum OutcomeError {
    /// The record vanished between the failed create and the re-read (TTL
    /// sweep or admin deletion). Surfaced explicitly; never retried here.
    #[error("outcome record for intent {action_intent_id} disappeared mid-operation; raced a deletion")]
    RaceCondition { action_intent_id: String },
    #[error("invalid pagination token")]
    InvalidToken,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct OutcomeStore<S: KvStore> {
    store: S,
    retention_days: i64,
}

impl<S: KvStore> OutcomeStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            retention_days: 90,
        }
    }

    pub fn with_retention_days(mut self, retention_days: i64) -> Self {
        self.retention_days = retention_days;
        self
    }

    /// Record a terminal outcome. Returns the stored record: the freshly
    /// written one, or the pre-existing one when the write-once guard trips.
    pub async fn record(&self, outcome: ActionOutcome) -> Result<ActionOutcome, OutcomeError> {
        let ttl_epoch = outcome.completed_at.timestamp() + self.retention_days * 86_400;
        let completed_ms = outcome.completed_at.timestamp_millis();

        let pk = keys::tenant_account_pk(&outcome.tenant_id, &outcome.account_id);
        let sk = keys::outcome_sk(&outcome.action_intent_id);
        let body = serde_json::to_value(&outcome)
            .map_err(|e| StoreError::Backend(anyhow::Error::new(e).context("serialize outcome")))?;

        let item = Item::new(&pk, &sk, body)
            .with_ttl(ttl_epoch)
            .with_gsi1(IndexKey::new(
                keys::outcome_intent_gsi_pk(&outcome.action_intent_id),
                keys::completed_at_sk(completed_ms),
            ))
            .with_gsi2(IndexKey::new(
                keys::tenant_pk(&outcome.tenant_id),
                keys::completed_at_sk(completed_ms),
            ));

        match self.store.put(item, Condition::Absent).await {
            Ok(()) => Ok(outcome),
            Err(StoreError::ConditionFailed) => match self.store.get(&pk, &sk).await? {
                Some(existing) => decode(existing),
                None => Err(OutcomeError::RaceCondition {
                    action_intent_id: outcome.action_intent_id,
                }),
            },
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(
        &self,
        action_intent_id: &str,
        tenant_id: &str,
        account_id: &str,
    ) -> Result<Option<ActionOutcome>, OutcomeError> {
        let item = self
            .store
            .get(
                &keys::tenant_account_pk(tenant_id, account_id),
                &keys::outcome_sk(action_intent_id),
            )
            .await?;
        match item {
            Some(item) => Ok(Some(decode(item)?)),
            None => Ok(None),
        }
    }

    /// Page through an account's outcomes. `next_token` is opaque; feed the
    /// returned token back to resume.
    pub async fn list(
        &self,
        tenant_id: &str,
        account_id: &str,
        limit: i64,
        next_token: Option<&str>,
    ) -> Result<(Vec<ActionOutcome>, Option<String>), OutcomeError> {
        let mut q = KeyQuery::partition(keys::tenant_account_pk(tenant_id, account_id))
            .prefix("OUTCOME#")
            .limit(limit);
        if let Some(token) = next_token {
            q = q.start_after(decode_token(token)?);
        }

        let page = self.store.query(q).await?;
        let mut outcomes = Vec::with_capacity(page.items.len());
        for item in page.items {
            outcomes.push(decode(item)?);
        }
        Ok((outcomes, page.last_sk.as_deref().map(encode_token)))
    }

}

fn decode(item: Item) -> Result<ActionOutcome, OutcomeError> {
    serde_json::from_value(item.body)
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e).context("decode outcome")).into())
}

fn encode_token(sk: &str) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sk)
}

fn decode_token(token: &str) -> Result<String, OutcomeError> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| OutcomeError::InvalidToken)?;
    let sk = String::from_utf8(bytes).map_err(|_| OutcomeError::InvalidToken)?;
    if !sk.starts_with("OUTCOME#") {
        return Err(OutcomeError::InvalidToken);
    }
    Ok(sk)
}
