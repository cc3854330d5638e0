//! Typed façade over the composite-key item store.
//!
//! Every durable record in the pipeline (intents, attempts, outcomes,
//! registry entries, dedupe history, breaker state, ledger events) is an
//! [`Item`] under a composite `(pk, sk)` key. All mutation goes through
//! conditional writes; the `ConditionFailed` sentinel is the load-bearing
//! signal the locking and write-once layers are built on, and it is kept
//! strictly distinct from backend I/O errors (which the outer runtime may
//! retry; a failed condition must never be).
//!
//! Two implementations ship: [`PgKvStore`] (Postgres, the production
//! backend) and [`MemoryKvStore`] (the deterministic in-process double the
//! test suites run against).

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod keys;
pub mod memory;
pub mod pg;

pub use memory::MemoryKvStore;
pub use pg::{connect_from_env, migrate, status, DbStatus, PgKvStore, ENV_DB_URL};

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// Secondary-index key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey {
    pub pk: String,
    pub sk: String,
}

impl IndexKey {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }
}

/// One stored item: composite key, JSON object body, optional TTL epoch and
/// up to two secondary-index key pairs.
#[derive(Debug, Clone)]
pub struct Item {
    pub pk: String,
    pub sk: String,
    /// Always a JSON object.
    pub body: Value,
    /// Advisory expiry (epoch seconds). Expiry is swept offline; reads do
    /// not filter on it, mirroring how TTL deletion lags in practice.
    pub ttl_epoch: Option<i64>,
    pub gsi1: Option<IndexKey>,
    pub gsi2: Option<IndexKey>,
}

impl Item {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>, body: Value) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
            body,
            ttl_epoch: None,
            gsi1: None,
            gsi2: None,
        }
    }

    pub fn with_ttl(mut self, ttl_epoch: i64) -> Self {
        self.ttl_epoch = Some(ttl_epoch);
        self
    }

    pub fn with_gsi1(mut self, key: IndexKey) -> Self {
        self.gsi1 = Some(key);
        self
    }

    pub fn with_gsi2(mut self, key: IndexKey) -> Self {
        self.gsi2 = Some(key);
        self
    }

    /// Convenience accessor for a string attribute of the body.
    pub fn str_attr(&self, field: &str) -> Option<&str> {
        self.body.get(field).and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Conditions and updates
// ---------------------------------------------------------------------------

/// Condition expression attached to a write.
#[derive(Debug, Clone)]
pub enum Condition {
    /// Unconditional.
    None,
    /// The key must not exist (create-if-absent).
    Absent,
    /// `body[field] == value` on the existing item.
    AttributeEquals(String, Value),
    /// `body[field]` is one of `values` on the existing item.
    AttributeIn(String, Vec<Value>),
}

impl Condition {
    /// Evaluate against an existing item's body (`None` = item absent).
    pub(crate) fn evaluate(&self, existing: Option<&Value>) -> bool {
        match self {
            Condition::None => true,
            Condition::Absent => existing.is_none(),
            Condition::AttributeEquals(field, want) => match existing {
                Some(body) => body.get(field) == Some(want),
                None => false,
            },
            Condition::AttributeIn(field, wants) => match existing {
                Some(body) => body
                    .get(field)
                    .map(|got| wants.iter().any(|w| w == got))
                    .unwrap_or(false),
                None => false,
            },
        }
    }
}

/// SET / REMOVE update applied to an existing item, with optional TTL and
/// secondary-index refresh.
#[derive(Debug, Clone, Default)]
pub struct Update {
    pub set: Vec<(String, Value)>,
    pub remove: Vec<String>,
    pub ttl_epoch: Option<i64>,
    pub gsi1: Option<IndexKey>,
    pub gsi2: Option<IndexKey>,
}

impl Update {
    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.set.push((field.into(), value));
        self
    }

    pub fn remove(mut self, field: impl Into<String>) -> Self {
        self.remove.push(field.into());
        self
    }

    pub fn ttl(mut self, ttl_epoch: i64) -> Self {
        self.ttl_epoch = Some(ttl_epoch);
        self
    }

    pub fn gsi1(mut self, key: IndexKey) -> Self {
        self.gsi1 = Some(key);
        self
    }

    pub fn gsi2(mut self, key: IndexKey) -> Self {
        self.gsi2 = Some(key);
        self
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Partition query with optional sort-key prefix, direction, limit, and an
/// exclusive resume position for pagination.
#[derive(Debug, Clone)]
pub struct KeyQuery {
    pub pk: String,
    pub sk_prefix: Option<String>,
    pub forward: bool,
    pub limit: Option<i64>,
    /// Exclusive sort-key bound: items strictly after (forward) or before
    /// (backward) this position.
    pub start_after: Option<String>,
}

impl KeyQuery {
    pub fn partition(pk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk_prefix: None,
            forward: true,
            limit: None,
            start_after: None,
        }
    }

    pub fn prefix(mut self, sk_prefix: impl Into<String>) -> Self {
        self.sk_prefix = Some(sk_prefix.into());
        self
    }

    pub fn descending(mut self) -> Self {
        self.forward = false;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, sk: impl Into<String>) -> Self {
        self.start_after = Some(sk.into());
        self
    }
}

/// Which secondary index a [`KvStore::query_index`] call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexName {
    Gsi1,
    Gsi2,
}

/// A page of query results. `last_sk` is the sort-key position of the last
/// returned item when the page was cut by `limit` (resume with
/// `start_after`); `None` means the partition is exhausted.
#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<Item>,
    pub last_sk: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Store failure. `ConditionFailed` is a correctness signal and must be
/// matched on by callers; `Backend` is transient I/O that the orchestration
/// runtime's retry policy owns.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conditional write failed")]
    ConditionFailed,
    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, StoreError::ConditionFailed)
    }
}

// ---------------------------------------------------------------------------
// KvStore trait
// ---------------------------------------------------------------------------

/// The conditional-write item store every pipeline component is built on.
///
/// Reads are strongly consistent with respect to prior writes through the
/// same store (single Postgres primary; in-memory map).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, pk: &str, sk: &str) -> Result<Option<Item>, StoreError>;

    /// Write an item, guarded by `cond`. A failed condition surfaces as
    /// [`StoreError::ConditionFailed`], never as a generic error.
    async fn put(&self, item: Item, cond: Condition) -> Result<(), StoreError>;

    /// Apply a SET/REMOVE update to an existing item, guarded by `cond`.
    /// Returns the updated item. A missing item or a failed condition both
    /// surface as `ConditionFailed`; callers that need to distinguish the
    /// two re-read the key.
    async fn update(
        &self,
        pk: &str,
        sk: &str,
        update: Update,
        cond: Condition,
    ) -> Result<Item, StoreError>;

    /// Delete an item. Returns `true` when a row existed.
    async fn delete(&self, pk: &str, sk: &str) -> Result<bool, StoreError>;

    async fn query(&self, q: KeyQuery) -> Result<Page, StoreError>;

    async fn query_index(&self, index: IndexName, q: KeyQuery) -> Result<Page, StoreError>;
}

// Components are generic over `S: KvStore`; production wiring shares one
// backend via `Arc<dyn KvStore>`, so delegate through the pointer.
#[async_trait]
impl<T: KvStore + ?Sized> KvStore for std::sync::Arc<T> {
    async fn get(&self, pk: &str, sk: &str) -> Result<Option<Item>, StoreError> {
        (**self).get(pk, sk).await
    }

    async fn put(&self, item: Item, cond: Condition) -> Result<(), StoreError> {
        (**self).put(item, cond).await
    }

    async fn update(
        &self,
        pk: &str,
        sk: &str,
        update: Update,
        cond: Condition,
    ) -> Result<Item, StoreError> {
        (**self).update(pk, sk, update, cond).await
    }

    async fn delete(&self, pk: &str, sk: &str) -> Result<bool, StoreError> {
        (**self).delete(pk, sk).await
    }

    async fn query(&self, q: KeyQuery) -> Result<Page, StoreError> {
        (**self).query(q).await
    }

    async fn query_index(&self, index: IndexName, q: KeyQuery) -> Result<Page, StoreError> {
        (**self).query_index(index, q).await
    }
}
