//! The single place that owns the key layout.
//!
//! Every composite key in the store is composed here so a key-schema change
//! is a one-file diff. Values interpolated into keys are caller-controlled
//! identifiers; `#` is the reserved separator.

/// Tenant + account partition key shared by intents, attempts, and outcomes.
pub fn tenant_account_pk(tenant_id: &str, account_id: &str) -> String {
    format!("TENANT#{tenant_id}#ACCOUNT#{account_id}")
}

pub fn action_intent_sk(action_intent_id: &str) -> String {
    format!("ACTION_INTENT#{action_intent_id}")
}

pub fn execution_sk(action_intent_id: &str) -> String {
    format!("EXECUTION#{action_intent_id}")
}

pub fn outcome_sk(action_intent_id: &str) -> String {
    format!("OUTCOME#{action_intent_id}")
}

// Registry: partitioned by action type, sorted by version.

pub fn action_type_pk(action_type: &str) -> String {
    format!("ACTION_TYPE#{action_type}")
}

pub const REGISTRY_VERSION_PREFIX: &str = "REGISTRY_VERSION#";

pub fn registry_version_sk(registry_version: i64) -> String {
    format!("{REGISTRY_VERSION_PREFIX}{registry_version}")
}

// Adapter-layer dedupe: partitioned by hashed idempotency key.

pub fn idempotency_pk(key_hash: &str) -> String {
    format!("IDEMPOTENCY_KEY#{key_hash}")
}

pub const DEDUPE_LATEST_SK: &str = "LATEST";

pub const DEDUPE_HISTORY_PREFIX: &str = "CREATED_AT#";

pub fn dedupe_history_sk(created_at_epoch_ms: i64) -> String {
    format!("{DEDUPE_HISTORY_PREFIX}{created_at_epoch_ms}")
}

// Event ledger: tenant+account partition, time-ordered sort key, plus a
// trace GSI and a tenant+time GSI.

pub const EVENT_PREFIX: &str = "EVENT#";

pub fn event_sk(timestamp_epoch_ms: i64, event_id: &str) -> String {
    // Zero-padded so lexical order equals time order within a partition.
    format!("{EVENT_PREFIX}{timestamp_epoch_ms:015}#{event_id}")
}

pub fn trace_pk(trace_id: &str) -> String {
    format!("TRACE#{trace_id}")
}

pub fn tenant_pk(tenant_id: &str) -> String {
    format!("TENANT#{tenant_id}")
}

pub const TIMESTAMP_PREFIX: &str = "TIMESTAMP#";

pub fn timestamp_sk(timestamp_epoch_ms: i64) -> String {
    format!("{TIMESTAMP_PREFIX}{timestamp_epoch_ms:015}")
}

// Outcome secondary indices.

pub fn outcome_intent_gsi_pk(action_intent_id: &str) -> String {
    format!("ACTION_INTENT#{action_intent_id}")
}

pub const COMPLETED_AT_PREFIX: &str = "COMPLETED_AT#";

pub fn completed_at_sk(completed_at_epoch_ms: i64) -> String {
    format!("{COMPLETED_AT_PREFIX}{completed_at_epoch_ms:015}")
}

pub const UPDATED_AT_PREFIX: &str = "UPDATED_AT#";

pub fn updated_at_sk(updated_at_epoch_ms: i64) -> String {
    format!("{UPDATED_AT_PREFIX}{updated_at_epoch_ms:015}")
}

// Resilience + policy.

pub fn connector_pk(connector_id: &str) -> String {
    format!("CONNECTOR#{connector_id}")
}

pub const CIRCUIT_BREAKER_SK: &str = "CIRCUIT_BREAKER";

pub const EXECUTION_POLICY_SK: &str = "CONFIG#EXECUTION_POLICY";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_sk_orders_lexically_by_time() {
        let early = event_sk(999, "b");
        let late = event_sk(1_000_000_000_000, "a");
        assert!(early < late);
    }

    #[test]
    fn tenant_account_pk_shape() {
        assert_eq!(tenant_account_pk("t1", "a1"), "TENANT#t1#ACCOUNT#a1");
    }
}
