//! Deterministic in-process store double.
//!
//! Implements the exact condition semantics of the Postgres backend over a
//! `BTreeMap`, so lock, dedupe, and write-once behavior can be proven in
//! unit and scenario tests without a database. Also exposes
//! [`MemoryKvStore::expire_now`] to simulate a TTL deletion racing a
//! conditional write.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{
    Condition, IndexName, Item, KeyQuery, KvStore, Page, StoreError, Update,
};

#[derive(Default)]
pub struct MemoryKvStore {
    items: RwLock<BTreeMap<(String, String), Item>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove an item as the TTL sweeper would, regardless of its expiry.
    /// Test hook for the vanished-between-write-and-read race paths.
    pub async fn expire_now(&self, pk: &str, sk: &str) -> bool {
        self.items
            .write()
            .await
            .remove(&(pk.to_string(), sk.to_string()))
            .is_some()
    }

    /// Delete every item whose `ttl_epoch` has passed. Returns the count.
    pub async fn sweep_expired(&self, now_epoch: i64) -> u64 {
        let mut items = self.items.write().await;
        let doomed: Vec<(String, String)> = items
            .iter()
            .filter(|(_, it)| it.ttl_epoch.map(|t| t <= now_epoch).unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &doomed {
            items.remove(k);
        }
        doomed.len() as u64
    }

    fn page_from(items: Vec<Item>, q: &KeyQuery, sk_of: impl Fn(&Item) -> String) -> Page {
        let mut items = items;
        let limit = q.limit.unwrap_or(i64::MAX).max(0) as usize;
        let truncated = items.len() > limit;
        items.truncate(limit);
        let last_sk = if truncated {
            items.last().map(&sk_of)
        } else {
            None
        };
        Page { items, last_sk }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, pk: &str, sk: &str) -> Result<Option<Item>, StoreError> {
        Ok(self
            .items
            .read()
            .await
            .get(&(pk.to_string(), sk.to_string()))
            .cloned())
    }

    async fn put(&self, item: Item, cond: Condition) -> Result<(), StoreError> {
        let mut items = self.items.write().await;
        let key = (item.pk.clone(), item.sk.clone());
        let existing = items.get(&key).map(|it| &it.body);
        if !cond.evaluate(existing) {
            return Err(StoreError::ConditionFailed);
        }
        items.insert(key, item);
        Ok(())
    }

    async fn update(
        &self,
        pk: &str,
        sk: &str,
        update: Update,
        cond: Condition,
    ) -> Result<Item, StoreError> {
        if matches!(cond, Condition::Absent) {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "Absent condition is not valid for update"
            )));
        }

        let mut items = self.items.write().await;
        let key = (pk.to_string(), sk.to_string());
        let existing = match items.get_mut(&key) {
            Some(it) => it,
            // Missing item and failed condition are the same signal here;
            // callers that care re-read the key.
            None => return Err(StoreError::ConditionFailed),
        };
        if !cond.evaluate(Some(&existing.body)) {
            return Err(StoreError::ConditionFailed);
        }

        if let Value::Object(body) = &mut existing.body {
            for (field, value) in update.set {
                body.insert(field, value);
            }
            for field in &update.remove {
                body.remove(field);
            }
        }
        if let Some(ttl) = update.ttl_epoch {
            existing.ttl_epoch = Some(ttl);
        }
        if let Some(gsi1) = update.gsi1 {
            existing.gsi1 = Some(gsi1);
        }
        if let Some(gsi2) = update.gsi2 {
            existing.gsi2 = Some(gsi2);
        }

        Ok(existing.clone())
    }

    async fn delete(&self, pk: &str, sk: &str) -> Result<bool, StoreError> {
        Ok(self
            .items
            .write()
            .await
            .remove(&(pk.to_string(), sk.to_string()))
            .is_some())
    }

    async fn query(&self, q: KeyQuery) -> Result<Page, StoreError> {
        let items = self.items.read().await;
        let range = items.range((
            Bound::Included((q.pk.clone(), String::new())),
            Bound::Excluded((format!("{}\u{10FFFF}", q.pk), String::new())),
        ));

        let mut matched: Vec<Item> = range
            .filter(|((ipk, isk), _)| {
                ipk == &q.pk
                    && q.sk_prefix
                        .as_deref()
                        .map(|p| isk.starts_with(p))
                        .unwrap_or(true)
            })
            .map(|(_, it)| it.clone())
            .collect();

        matched.sort_by(|a, b| a.sk.cmp(&b.sk));
        if !q.forward {
            matched.reverse();
        }
        if let Some(after) = &q.start_after {
            matched.retain(|it| {
                if q.forward {
                    it.sk > *after
                } else {
                    it.sk < *after
                }
            });
        }

        Ok(Self::page_from(matched, &q, |it| it.sk.clone()))
    }

    async fn query_index(&self, index: IndexName, q: KeyQuery) -> Result<Page, StoreError> {
        let items = self.items.read().await;

        let key_of = |it: &Item| match index {
            IndexName::Gsi1 => it.gsi1.clone(),
            IndexName::Gsi2 => it.gsi2.clone(),
        };

        let mut matched: Vec<(String, Item)> = items
            .values()
            .filter_map(|it| {
                let ik = key_of(it)?;
                if ik.pk != q.pk {
                    return None;
                }
                if let Some(p) = q.sk_prefix.as_deref() {
                    if !ik.sk.starts_with(p) {
                        return None;
                    }
                }
                Some((ik.sk, it.clone()))
            })
            .collect();

        matched.sort_by(|a, b| a.0.cmp(&b.0));
        if !q.forward {
            matched.reverse();
        }
        if let Some(after) = &q.start_after {
            matched.retain(|(sk, _)| if q.forward { sk > after } else { sk < after });
        }

        let sks: Vec<String> = matched.iter().map(|(sk, _)| sk.clone()).collect();
        let just_items: Vec<Item> = matched.into_iter().map(|(_, it)| it).collect();

        let limit = q.limit.unwrap_or(i64::MAX).max(0) as usize;
        let truncated = just_items.len() > limit;
        let items_page: Vec<Item> = just_items.into_iter().take(limit).collect();
        let last_sk = if truncated {
            sks.get(items_page.len().saturating_sub(1)).cloned()
        } else {
            None
        };

        Ok(Page {
            items: items_page,
            last_sk,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(pk: &str, sk: &str, body: Value) -> Item {
        Item::new(pk, sk, body)
    }

    #[tokio::test]
    async fn absent_condition_enforces_create_once() {
        let store = MemoryKvStore::new();
        store
            .put(item("p", "s", json!({"status": "RUNNING"})), Condition::Absent)
            .await
            .unwrap();

        let err = store
            .put(item("p", "s", json!({"status": "RUNNING"})), Condition::Absent)
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());

        // The original body survives the failed second create.
        let got = store.get("p", "s").await.unwrap().unwrap();
        assert_eq!(got.str_attr("status"), Some("RUNNING"));
    }

    #[tokio::test]
    async fn attribute_equals_guards_update() {
        let store = MemoryKvStore::new();
        store
            .put(item("p", "s", json!({"status": "RUNNING", "n": 1})), Condition::None)
            .await
            .unwrap();

        let updated = store
            .update(
                "p",
                "s",
                Update::default().set("status", json!("SUCCEEDED")),
                Condition::AttributeEquals("status".into(), json!("RUNNING")),
            )
            .await
            .unwrap();
        assert_eq!(updated.str_attr("status"), Some("SUCCEEDED"));

        // Second transition must fail: status is no longer RUNNING.
        let err = store
            .update(
                "p",
                "s",
                Update::default().set("status", json!("FAILED")),
                Condition::AttributeEquals("status".into(), json!("RUNNING")),
            )
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());
    }

    #[tokio::test]
    async fn attribute_in_matches_any_member() {
        let store = MemoryKvStore::new();
        store
            .put(item("p", "s", json!({"status": "FAILED"})), Condition::None)
            .await
            .unwrap();

        let res = store
            .update(
                "p",
                "s",
                Update::default().set("status", json!("RUNNING")),
                Condition::AttributeIn(
                    "status".into(),
                    vec![json!("SUCCEEDED"), json!("FAILED"), json!("CANCELLED")],
                ),
            )
            .await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn update_remove_drops_attribute() {
        let store = MemoryKvStore::new();
        store
            .put(
                item("p", "s", json!({"status": "FAILED", "last_error_class": "UNKNOWN"})),
                Condition::None,
            )
            .await
            .unwrap();

        let updated = store
            .update(
                "p",
                "s",
                Update::default()
                    .set("status", json!("RUNNING"))
                    .remove("last_error_class"),
                Condition::None,
            )
            .await
            .unwrap();
        assert!(updated.body.get("last_error_class").is_none());
    }

    #[tokio::test]
    async fn update_on_missing_key_is_condition_failed() {
        let store = MemoryKvStore::new();
        let err = store
            .update("p", "gone", Update::default(), Condition::None)
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());
    }

    #[tokio::test]
    async fn query_prefix_and_direction() {
        let store = MemoryKvStore::new();
        for (sk, n) in [("CREATED_AT#001", 1), ("CREATED_AT#002", 2), ("LATEST", 0)] {
            store
                .put(item("p", sk, json!({ "n": n })), Condition::None)
                .await
                .unwrap();
        }

        let page = store
            .query(
                KeyQuery::partition("p")
                    .prefix("CREATED_AT#")
                    .descending()
                    .limit(1),
            )
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].sk, "CREATED_AT#002");
    }

    #[tokio::test]
    async fn query_pagination_resumes_after_last_sk() {
        let store = MemoryKvStore::new();
        for sk in ["OUTCOME#a", "OUTCOME#b", "OUTCOME#c"] {
            store
                .put(item("p", sk, json!({})), Condition::None)
                .await
                .unwrap();
        }

        let first = store
            .query(KeyQuery::partition("p").prefix("OUTCOME#").limit(2))
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        let resume = first.last_sk.expect("page was cut, resume position expected");

        let second = store
            .query(
                KeyQuery::partition("p")
                    .prefix("OUTCOME#")
                    .limit(2)
                    .start_after(resume),
            )
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].sk, "OUTCOME#c");
        assert!(second.last_sk.is_none());
    }

    #[tokio::test]
    async fn query_index_filters_by_gsi_partition() {
        let store = MemoryKvStore::new();
        store
            .put(
                item("p1", "s1", json!({"x": 1}))
                    .with_gsi1(crate::IndexKey::new("TRACE#t-1", "TIMESTAMP#1")),
                Condition::None,
            )
            .await
            .unwrap();
        store
            .put(
                item("p2", "s2", json!({"x": 2}))
                    .with_gsi1(crate::IndexKey::new("TRACE#t-2", "TIMESTAMP#2")),
                Condition::None,
            )
            .await
            .unwrap();

        let page = store
            .query_index(IndexName::Gsi1, KeyQuery::partition("TRACE#t-1"))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].pk, "p1");
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let store = MemoryKvStore::new();
        store
            .put(item("p", "old", json!({})).with_ttl(100), Condition::None)
            .await
            .unwrap();
        store
            .put(item("p", "new", json!({})).with_ttl(10_000), Condition::None)
            .await
            .unwrap();

        let swept = store.sweep_expired(5_000).await;
        assert_eq!(swept, 1);
        assert!(store.get("p", "old").await.unwrap().is_none());
        assert!(store.get("p", "new").await.unwrap().is_some());
    }
}
