//! Versioned action-type registry.
//!
//! Maps `(action_type, registry_version)` to a tool descriptor plus the
//! parameter transforms applied on the way to the gateway. Entries are
//! immutable once written and versions increase monotonically per type, so
//! an intent pinned to a version always executes against exactly the entry
//! it was approved with: registry edits mid-flight cannot change a running
//! execution, and reruns select the same tool every time.
//!
//! "Latest" means the numerically highest version, never the newest
//! wall-clock write.

use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use axp_schemas::{ParamTransform, RegistryEntry};
use axp_store::{keys, Condition, Item, KeyQuery, KvStore, StoreError};

/// Registration input; the registry assigns the version.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NewRegistryEntry {
    pub action_type: String,
    pub tool_name: String,
    pub tool_schema_version: String,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    pub risk_class: axp_schemas::RiskClass,
    pub compensation_strategy: axp_schemas::CompensationStrategy,
    #[serde(default)]
    pub parameter_mapping: Vec<axp_schemas::ParameterMapping>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Another writer took the version this register cycle computed.
    /// The admin path retries the read-assign-create cycle; the store
    /// itself never retries.
    #[error("registry version {version} for {action_type} already exists")]
    VersionConflict { action_type: String, version: i64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("required parameter missing: {field}")]
    MissingRequired { field: String },
}

pub struct RegistryStore<S: KvStore> {
    store: S,
}

impl<S: KvStore> RegistryStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Fetch a mapping. With a version this is a direct key read; without,
    /// the partition is scanned and the numerically highest valid version
    /// wins.
    pub async fn get_mapping(
        &self,
        action_type: &str,
        version: Option<i64>,
    ) -> Result<Option<RegistryEntry>, StoreError> {
        match version {
            Some(v) => {
                let item = self
                    .store
                    .get(&keys::action_type_pk(action_type), &keys::registry_version_sk(v))
                    .await?;
                Ok(item.and_then(|it| decode_entry(action_type, it)))
            }
            None => {
                let page = self
                    .store
                    .query(
                        KeyQuery::partition(keys::action_type_pk(action_type))
                            .prefix(keys::REGISTRY_VERSION_PREFIX),
                    )
                    .await?;

                let mut entries: Vec<RegistryEntry> = page
                    .items
                    .into_iter()
                    .filter_map(|it| decode_entry(action_type, it))
                    .filter(|e| e.registry_version > 0)
                    .collect();

                // Highest numeric version wins; the sort-key order is
                // lexical and must not be trusted (10 sorts before 2).
                entries.sort_by(|a, b| b.registry_version.cmp(&a.registry_version));
                Ok(entries.into_iter().next())
            }
        }
    }

    /// Map intent parameters into tool arguments per the entry's rules.
    /// Unmapped source fields are dropped.
    pub fn map_parameters(
        entry: &RegistryEntry,
        params: &Value,
    ) -> Result<Map<String, Value>, MappingError> {
        let source = params.as_object();
        let mut out = Map::new();

        for rule in &entry.parameter_mapping {
            let value = source.and_then(|m| m.get(&rule.source_field));
            match value {
                None | Some(Value::Null) if rule.required => {
                    return Err(MappingError::MissingRequired {
                        field: rule.source_field.clone(),
                    });
                }
                None | Some(Value::Null) => continue,
                Some(v) => {
                    out.insert(rule.target_field.clone(), apply_transform(rule.transform, v));
                }
            }
        }

        Ok(out)
    }

    /// Admin path: register a new entry, auto-assigning `max + 1` (1 when
    /// the type has no entries). Creation is conditional on absence.
    pub async fn register(&self, input: NewRegistryEntry) -> Result<RegistryEntry, RegistryError> {
        let latest = self.get_mapping(&input.action_type, None).await?;
        let version = latest.map(|e| e.registry_version + 1).unwrap_or(1);

        let entry = RegistryEntry {
            action_type: input.action_type.clone(),
            registry_version: version,
            tool_name: input.tool_name,
            tool_schema_version: input.tool_schema_version,
            required_scopes: input.required_scopes,
            risk_class: input.risk_class,
            compensation_strategy: input.compensation_strategy,
            parameter_mapping: input.parameter_mapping,
            created_at: Some(Utc::now()),
        };

        let body = serde_json::to_value(&entry)
            .map_err(|e| StoreError::Backend(anyhow::Error::new(e).context("serialize entry")))?;
        let item = Item::new(
            keys::action_type_pk(&entry.action_type),
            keys::registry_version_sk(version),
            body,
        );

        match self.store.put(item, Condition::Absent).await {
            Ok(()) => Ok(entry),
            Err(StoreError::ConditionFailed) => Err(RegistryError::VersionConflict {
                action_type: entry.action_type,
                version,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

fn decode_entry(action_type: &str, item: Item) -> Option<RegistryEntry> {
    match serde_json::from_value::<RegistryEntry>(item.body) {
        Ok(entry) => Some(entry),
        Err(e) => {
            // Discard malformed entries rather than failing selection.
            warn!(action_type, sk = %item.sk, error = %e, "skipping invalid registry item");
            None
        }
    }
}

fn apply_transform(transform: ParamTransform, value: &Value) -> Value {
    match transform {
        ParamTransform::Passthrough => value.clone(),
        ParamTransform::Uppercase => Value::String(stringify(value).to_uppercase()),
        ParamTransform::Lowercase => Value::String(stringify(value).to_lowercase()),
    }
}

/// String form used by the case transforms: strings stay bare, everything
/// else uses its JSON representation.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
