//! Postgres implementation of the item store.
//!
//! A single `kv_items` table carries every entity: composite `(pk, sk)`
//! primary key, `jsonb` body, TTL epoch column, and two secondary-index
//! column pairs with partial indexes. Conditional writes compile to
//! `INSERT … ON CONFLICT DO NOTHING` / `UPDATE … WHERE <cond> RETURNING`;
//! a statement that touches no row is the `ConditionFailed` sentinel.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::{
    Condition, IndexKey, IndexName, Item, KeyQuery, KvStore, Page, StoreError, Update,
};

pub const ENV_DB_URL: &str = "AXP_DATABASE_URL";

/// Connect to Postgres using AXP_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_kv_table: bool,
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='kv_items'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_kv_table: exists,
    })
}

pub struct PgKvStore {
    pool: PgPool,
}

impl PgKvStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Delete every row whose TTL epoch has passed. Returns the count.
    /// Driven by the admin CLI; reads never filter on TTL.
    pub async fn sweep_expired(&self, now_epoch: i64) -> Result<u64, StoreError> {
        let res = sqlx::query(
            r#"
            delete from kv_items
            where ttl_epoch is not null
              and ttl_epoch <= $1
            "#,
        )
        .bind(now_epoch)
        .execute(&self.pool)
        .await
        .map_err(|e| backend(e, "sweep_expired"))?;

        Ok(res.rows_affected())
    }
}

fn backend(e: sqlx::Error, what: &str) -> StoreError {
    StoreError::Backend(anyhow!(e).context(format!("kv {what} failed")))
}

/// Escape LIKE wildcards so a key prefix matches literally.
/// Sort keys use `_` (e.g. `CREATED_AT#`), which LIKE would treat as a
/// single-character wildcard.
fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn row_to_item(row: &PgRow) -> Result<Item, StoreError> {
    let gsi1_pk: Option<String> = row
        .try_get("gsi1_pk")
        .map_err(|e| backend(e, "decode gsi1_pk"))?;
    let gsi1_sk: Option<String> = row
        .try_get("gsi1_sk")
        .map_err(|e| backend(e, "decode gsi1_sk"))?;
    let gsi2_pk: Option<String> = row
        .try_get("gsi2_pk")
        .map_err(|e| backend(e, "decode gsi2_pk"))?;
    let gsi2_sk: Option<String> = row
        .try_get("gsi2_sk")
        .map_err(|e| backend(e, "decode gsi2_sk"))?;

    let gsi1 = match (gsi1_pk, gsi1_sk) {
        (Some(pk), Some(sk)) => Some(IndexKey { pk, sk }),
        _ => None,
    };
    let gsi2 = match (gsi2_pk, gsi2_sk) {
        (Some(pk), Some(sk)) => Some(IndexKey { pk, sk }),
        _ => None,
    };

    Ok(Item {
        pk: row.try_get("pk").map_err(|e| backend(e, "decode pk"))?,
        sk: row.try_get("sk").map_err(|e| backend(e, "decode sk"))?,
        body: row.try_get("body").map_err(|e| backend(e, "decode body"))?,
        ttl_epoch: row
            .try_get("ttl_epoch")
            .map_err(|e| backend(e, "decode ttl_epoch"))?,
        gsi1,
        gsi2,
    })
}

const ITEM_COLUMNS: &str = "pk, sk, body, ttl_epoch, gsi1_pk, gsi1_sk, gsi2_pk, gsi2_sk";

#[async_trait]
impl KvStore for PgKvStore {
    async fn get(&self, pk: &str, sk: &str) -> Result<Option<Item>, StoreError> {
        let row = sqlx::query(&format!(
            "select {ITEM_COLUMNS} from kv_items where pk = $1 and sk = $2"
        ))
        .bind(pk)
        .bind(sk)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend(e, "get"))?;

        match row {
            Some(r) => Ok(Some(row_to_item(&r)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, item: Item, cond: Condition) -> Result<(), StoreError> {
        let (gsi1_pk, gsi1_sk) = split_index(&item.gsi1);
        let (gsi2_pk, gsi2_sk) = split_index(&item.gsi2);

        match cond {
            Condition::Absent => {
                let row: Option<(String,)> = sqlx::query_as(
                    r#"
                    insert into kv_items (pk, sk, body, ttl_epoch, gsi1_pk, gsi1_sk, gsi2_pk, gsi2_sk)
                    values ($1, $2, $3, $4, $5, $6, $7, $8)
                    on conflict (pk, sk) do nothing
                    returning pk
                    "#,
                )
                .bind(&item.pk)
                .bind(&item.sk)
                .bind(&item.body)
                .bind(item.ttl_epoch)
                .bind(gsi1_pk)
                .bind(gsi1_sk)
                .bind(gsi2_pk)
                .bind(gsi2_sk)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| backend(e, "put (create)"))?;

                if row.is_none() {
                    return Err(StoreError::ConditionFailed);
                }
                Ok(())
            }
            Condition::None => {
                sqlx::query(
                    r#"
                    insert into kv_items (pk, sk, body, ttl_epoch, gsi1_pk, gsi1_sk, gsi2_pk, gsi2_sk)
                    values ($1, $2, $3, $4, $5, $6, $7, $8)
                    on conflict (pk, sk) do update
                        set body = excluded.body,
                            ttl_epoch = excluded.ttl_epoch,
                            gsi1_pk = excluded.gsi1_pk,
                            gsi1_sk = excluded.gsi1_sk,
                            gsi2_pk = excluded.gsi2_pk,
                            gsi2_sk = excluded.gsi2_sk,
                            updated_at_utc = now()
                    "#,
                )
                .bind(&item.pk)
                .bind(&item.sk)
                .bind(&item.body)
                .bind(item.ttl_epoch)
                .bind(gsi1_pk)
                .bind(gsi1_sk)
                .bind(gsi2_pk)
                .bind(gsi2_sk)
                .execute(&self.pool)
                .await
                .map_err(|e| backend(e, "put (upsert)"))?;
                Ok(())
            }
            Condition::AttributeEquals(field, want) => {
                let row: Option<(String,)> = sqlx::query_as(
                    r#"
                    update kv_items
                       set body = $3,
                           ttl_epoch = $4,
                           gsi1_pk = $5, gsi1_sk = $6,
                           gsi2_pk = $7, gsi2_sk = $8,
                           updated_at_utc = now()
                     where pk = $1 and sk = $2
                       and body -> $9::text = $10::jsonb
                    returning pk
                    "#,
                )
                .bind(&item.pk)
                .bind(&item.sk)
                .bind(&item.body)
                .bind(item.ttl_epoch)
                .bind(gsi1_pk)
                .bind(gsi1_sk)
                .bind(gsi2_pk)
                .bind(gsi2_sk)
                .bind(&field)
                .bind(&want)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| backend(e, "put (guarded replace)"))?;

                if row.is_none() {
                    return Err(StoreError::ConditionFailed);
                }
                Ok(())
            }
            Condition::AttributeIn(field, wants) => {
                let row: Option<(String,)> = sqlx::query_as(
                    r#"
                    update kv_items
                       set body = $3,
                           ttl_epoch = $4,
                           gsi1_pk = $5, gsi1_sk = $6,
                           gsi2_pk = $7, gsi2_sk = $8,
                           updated_at_utc = now()
                     where pk = $1 and sk = $2
                       and body -> $9::text in (select jsonb_array_elements($10::jsonb))
                    returning pk
                    "#,
                )
                .bind(&item.pk)
                .bind(&item.sk)
                .bind(&item.body)
                .bind(item.ttl_epoch)
                .bind(gsi1_pk)
                .bind(gsi1_sk)
                .bind(gsi2_pk)
                .bind(gsi2_sk)
                .bind(&field)
                .bind(Value::Array(wants))
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| backend(e, "put (guarded replace)"))?;

                if row.is_none() {
                    return Err(StoreError::ConditionFailed);
                }
                Ok(())
            }
        }
    }

    async fn update(
        &self,
        pk: &str,
        sk: &str,
        update: Update,
        cond: Condition,
    ) -> Result<Item, StoreError> {
        let set_obj: Value = Value::Object(update.set.into_iter().collect());
        let remove: Vec<String> = update.remove;
        let (gsi1_pk, gsi1_sk) = split_index(&update.gsi1);
        let (gsi2_pk, gsi2_sk) = split_index(&update.gsi2);

        let (cond_sql, cond_field, cond_value): (&str, Option<String>, Option<Value>) = match cond {
            Condition::None => ("", None, None),
            Condition::Absent => {
                return Err(StoreError::Backend(anyhow!(
                    "Absent condition is not valid for update"
                )));
            }
            Condition::AttributeEquals(field, want) => (
                " and body -> $10::text = $11::jsonb",
                Some(field),
                Some(want),
            ),
            Condition::AttributeIn(field, wants) => (
                " and body -> $10::text in (select jsonb_array_elements($11::jsonb))",
                Some(field),
                Some(Value::Array(wants)),
            ),
        };

        let sql = format!(
            r#"
            update kv_items
               set body = (body || $3::jsonb) - $4::text[],
                   ttl_epoch = coalesce($5, ttl_epoch),
                   gsi1_pk = coalesce($6, gsi1_pk), gsi1_sk = coalesce($7, gsi1_sk),
                   gsi2_pk = coalesce($8, gsi2_pk), gsi2_sk = coalesce($9, gsi2_sk),
                   updated_at_utc = now()
             where pk = $1 and sk = $2{cond_sql}
            returning {ITEM_COLUMNS}
            "#
        );

        let mut q = sqlx::query(&sql)
            .bind(pk)
            .bind(sk)
            .bind(&set_obj)
            .bind(&remove)
            .bind(update.ttl_epoch)
            .bind(gsi1_pk)
            .bind(gsi1_sk)
            .bind(gsi2_pk)
            .bind(gsi2_sk);
        if let Some(field) = cond_field {
            q = q.bind(field).bind(cond_value);
        }

        let row = q
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend(e, "update"))?;

        match row {
            Some(r) => row_to_item(&r),
            None => Err(StoreError::ConditionFailed),
        }
    }

    async fn delete(&self, pk: &str, sk: &str) -> Result<bool, StoreError> {
        let res = sqlx::query("delete from kv_items where pk = $1 and sk = $2")
            .bind(pk)
            .bind(sk)
            .execute(&self.pool)
            .await
            .map_err(|e| backend(e, "delete"))?;
        Ok(res.rows_affected() > 0)
    }

    async fn query(&self, q: KeyQuery) -> Result<Page, StoreError> {
        let mut sql = format!("select {ITEM_COLUMNS} from kv_items where pk = $1");
        let mut n = 1;

        if q.sk_prefix.is_some() {
            n += 1;
            sql.push_str(&format!(" and sk like ${n} escape '\\'"));
        }
        if q.start_after.is_some() {
            n += 1;
            let op = if q.forward { ">" } else { "<" };
            sql.push_str(&format!(" and sk {op} ${n}"));
        }
        sql.push_str(if q.forward {
            " order by sk asc"
        } else {
            " order by sk desc"
        });
        let fetch = q.limit.map(|l| l.max(0));
        if fetch.is_some() {
            n += 1;
            sql.push_str(&format!(" limit ${n}"));
        }

        let mut query = sqlx::query(&sql).bind(&q.pk);
        if let Some(prefix) = &q.sk_prefix {
            query = query.bind(format!("{}%", escape_like(prefix)));
        }
        if let Some(after) = &q.start_after {
            query = query.bind(after);
        }
        if let Some(limit) = fetch {
            // Fetch one extra row to detect whether the page was cut.
            query = query.bind(limit + 1);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend(e, "query"))?;

        let mut items = Vec::with_capacity(rows.len());
        for r in &rows {
            items.push(row_to_item(r)?);
        }
        Ok(cut_page(items, q.limit, |it| it.sk.clone()))
    }

    async fn query_index(&self, index: IndexName, q: KeyQuery) -> Result<Page, StoreError> {
        let (ipk, isk) = match index {
            IndexName::Gsi1 => ("gsi1_pk", "gsi1_sk"),
            IndexName::Gsi2 => ("gsi2_pk", "gsi2_sk"),
        };

        let mut sql = format!("select {ITEM_COLUMNS} from kv_items where {ipk} = $1");
        let mut n = 1;

        if q.sk_prefix.is_some() {
            n += 1;
            sql.push_str(&format!(" and {isk} like ${n} escape '\\'"));
        }
        if q.start_after.is_some() {
            n += 1;
            let op = if q.forward { ">" } else { "<" };
            sql.push_str(&format!(" and {isk} {op} ${n}"));
        }
        sql.push_str(&format!(
            " order by {isk} {}",
            if q.forward { "asc" } else { "desc" }
        ));
        let fetch = q.limit.map(|l| l.max(0));
        if fetch.is_some() {
            n += 1;
            sql.push_str(&format!(" limit ${n}"));
        }

        let mut query = sqlx::query(&sql).bind(&q.pk);
        if let Some(prefix) = &q.sk_prefix {
            query = query.bind(format!("{}%", escape_like(prefix)));
        }
        if let Some(after) = &q.start_after {
            query = query.bind(after);
        }
        if let Some(limit) = fetch {
            query = query.bind(limit + 1);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend(e, "query_index"))?;

        let mut items = Vec::with_capacity(rows.len());
        for r in &rows {
            items.push(row_to_item(r)?);
        }
        let sk_of = move |it: &Item| match index {
            IndexName::Gsi1 => it.gsi1.as_ref().map(|k| k.sk.clone()).unwrap_or_default(),
            IndexName::Gsi2 => it.gsi2.as_ref().map(|k| k.sk.clone()).unwrap_or_default(),
        };
        Ok(cut_page(items, q.limit, sk_of))
    }
}

fn split_index(key: &Option<IndexKey>) -> (Option<String>, Option<String>) {
    match key {
        Some(k) => (Some(k.pk.clone()), Some(k.sk.clone())),
        None => (None, None),
    }
}

fn cut_page(mut items: Vec<Item>, limit: Option<i64>, sk_of: impl Fn(&Item) -> String) -> Page {
    let limit = limit.unwrap_or(i64::MAX).max(0) as usize;
    let truncated = items.len() > limit;
    items.truncate(limit);
    let last_sk = if truncated {
        items.last().map(sk_of)
    } else {
        None
    };
    Page { items, last_sk }
}
