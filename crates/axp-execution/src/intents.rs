//! Read-only view of action intents.
//!
//! Intents are produced by the upstream approval pipeline; the executor
//! only reads them. The seed path exists for admin tooling and test
//! harnesses that stand in for that pipeline.

use axp_schemas::ActionIntent;
use axp_store::{keys, Condition, Item, KvStore, StoreError};

pub struct IntentStore<S: KvStore> {
    store: S,
}

impl<S: KvStore> IntentStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn get(
        &self,
        action_intent_id: &str,
        tenant_id: &str,
        account_id: &str,
    ) -> Result<Option<ActionIntent>, StoreError> {
        let item = self
            .store
            .get(
                &keys::tenant_account_pk(tenant_id, account_id),
                &keys::action_intent_sk(action_intent_id),
            )
            .await?;
        match item {
            Some(item) => {
                let intent = serde_json::from_value(item.body).map_err(|e| {
                    StoreError::Backend(anyhow::Error::new(e).context("decode intent"))
                })?;
                Ok(Some(intent))
            }
            None => Ok(None),
        }
    }

    /// Write an intent the way the approval pipeline would. Admin/test path.
    pub async fn seed(&self, intent: &ActionIntent) -> Result<(), StoreError> {
        let body = serde_json::to_value(intent)
            .map_err(|e| StoreError::Backend(anyhow::Error::new(e).context("serialize intent")))?;
        let item = Item::new(
            keys::tenant_account_pk(&intent.tenant_id, &intent.account_id),
            keys::action_intent_sk(&intent.action_intent_id),
            body,
        )
        .with_ttl(intent.expires_at_epoch);
        self.store.put(item, Condition::None).await
    }
}
