//! Kill-switch policy.
//!
//! Three gates, evaluated in order:
//!
//! 1. Process-wide emergency stop (environment flag), blocking everything.
//! 2. Per-tenant `execution_enabled` flag.
//! 3. Per-tenant disabled action types.
//!
//! A tenant with no policy record executes with everything enabled. The
//! verdict names the gate that refused so failure recording can classify
//! the refusal as a kill-switch validation failure.

use tracing::warn;

use axp_schemas::TenantExecutionPolicy;
use axp_store::{keys, Condition, Item, KvStore, StoreError};

/// Set to `1` or `true` to stop all execution process-wide. Read from the
/// environment on every check; the only global mutable state in the core.
pub const ENV_EMERGENCY_STOP: &str = "AXP_EMERGENCY_STOP";

/// Outcome of a kill-switch check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    Enabled,
    EmergencyStop,
    TenantDisabled,
    ActionTypeDisabled { action_type: String },
}

impl PolicyVerdict {
    pub fn allowed(&self) -> bool {
        matches!(self, PolicyVerdict::Enabled)
    }

    /// Stable cause string recorded on refusal; classified as a
    /// kill-switch validation failure downstream.
    pub fn refusal_cause(&self) -> Option<String> {
        match self {
            PolicyVerdict::Enabled => None,
            PolicyVerdict::EmergencyStop => Some("KILL_SWITCH_EMERGENCY_STOP".to_string()),
            PolicyVerdict::TenantDisabled => Some("KILL_SWITCH_TENANT_DISABLED".to_string()),
            PolicyVerdict::ActionTypeDisabled { action_type } => {
                Some(format!("KILL_SWITCH_ACTION_TYPE_DISABLED:{action_type}"))
            }
        }
    }
}

fn emergency_stop_engaged() -> bool {
    std::env::var(ENV_EMERGENCY_STOP)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub struct PolicyStore<S: KvStore> {
    store: S,
}

impl<S: KvStore> PolicyStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Evaluate all gates for a tenant (and optionally one action type).
    pub async fn is_execution_enabled(
        &self,
        tenant_id: &str,
        action_type: Option<&str>,
    ) -> Result<PolicyVerdict, StoreError> {
        if emergency_stop_engaged() {
            warn!(tenant_id, "emergency stop engaged; refusing execution");
            return Ok(PolicyVerdict::EmergencyStop);
        }

        let policy = self.get_tenant_policy(tenant_id).await?;

        if !policy.execution_enabled {
            return Ok(PolicyVerdict::TenantDisabled);
        }

        if let Some(action_type) = action_type {
            if policy
                .disabled_action_types
                .iter()
                .any(|t| t == action_type)
            {
                return Ok(PolicyVerdict::ActionTypeDisabled {
                    action_type: action_type.to_string(),
                });
            }
        }

        Ok(PolicyVerdict::Enabled)
    }

    /// The tenant's policy record; a missing record defaults to enabled
    /// with an empty disabled-types list.
    pub async fn get_tenant_policy(
        &self,
        tenant_id: &str,
    ) -> Result<TenantExecutionPolicy, StoreError> {
        let item = self
            .store
            .get(&keys::tenant_pk(tenant_id), keys::EXECUTION_POLICY_SK)
            .await?;
        match item {
            Some(item) => serde_json::from_value(item.body).map_err(|e| {
                StoreError::Backend(anyhow::Error::new(e).context("decode tenant policy"))
            }),
            None => Ok(TenantExecutionPolicy::default()),
        }
    }

    /// Admin path: install or replace a tenant's policy.
    pub async fn set_tenant_policy(
        &self,
        tenant_id: &str,
        policy: &TenantExecutionPolicy,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_value(policy)
            .map_err(|e| StoreError::Backend(anyhow::Error::new(e).context("serialize policy")))?;
        self.store
            .put(
                Item::new(keys::tenant_pk(tenant_id), keys::EXECUTION_POLICY_SK, body),
                Condition::None,
            )
            .await
    }
}
