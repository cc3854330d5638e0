//! Per-connector circuit breaker with durable state.
//!
//! State lives in the item store (14-day TTL) because OPEN must survive
//! worker churn; a fleet of stateless workers shares one breaker per
//! connector. Failure counting is windowed; concurrent probes in HALF_OPEN
//! are forbidden by a conditional flip of `half_open_probe_in_flight`.
//!
//! Callers supply `now_epoch` so the transition logic stays deterministic
//! and directly testable; the invoke wrapper passes wall-clock time.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use axp_store::{keys, Condition, Item, KvStore, StoreError, Update};

const STATE_TTL_SECONDS: i64 = 14 * 86_400;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the window that trip the breaker.
    pub failure_threshold: i64,
    /// Failure-counting window, seconds.
    pub window_seconds: i64,
    /// OPEN cooldown before a probe is admitted, seconds.
    pub cooldown_seconds: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_seconds: 60,
            cooldown_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BreakerState {
    state: BreakerPhase,
    failure_count: i64,
    window_start_epoch: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    open_until_epoch: Option<i64>,
    #[serde(default)]
    half_open_probe_in_flight: bool,
}

impl BreakerState {
    fn closed(now_epoch: i64) -> Self {
        Self {
            state: BreakerPhase::Closed,
            failure_count: 0,
            window_start_epoch: now_epoch,
            open_until_epoch: None,
            half_open_probe_in_flight: false,
        }
    }
}

/// Admission decision for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { retry_after_seconds: i64 },
}

pub struct CircuitBreaker<S: KvStore> {
    store: S,
    config: BreakerConfig,
}

impl<S: KvStore> CircuitBreaker<S> {
    pub fn new(store: S, config: BreakerConfig) -> Self {
        Self { store, config }
    }

    /// Admission check. May transition OPEN → HALF_OPEN when the cooldown
    /// has elapsed; in HALF_OPEN exactly one probe wins the conditional
    /// flag flip, every concurrent caller is denied.
    pub async fn allow_request(
        &self,
        connector_id: &str,
        now_epoch: i64,
    ) -> Result<Admission, StoreError> {
        let state = match self.load(connector_id).await? {
            Some(s) => s,
            None => return Ok(Admission::Allowed),
        };

        match state.state {
            BreakerPhase::Closed => Ok(Admission::Allowed),
            BreakerPhase::Open => {
                let open_until = state.open_until_epoch.unwrap_or(now_epoch);
                if now_epoch < open_until {
                    return Ok(Admission::Denied {
                        retry_after_seconds: (open_until - now_epoch).max(1),
                    });
                }
                // Cooldown elapsed: claim the single HALF_OPEN probe slot.
                let update = Update::default()
                    .set("state", json!(BreakerPhase::HalfOpen))
                    .set("half_open_probe_in_flight", json!(true))
                    .ttl(now_epoch + STATE_TTL_SECONDS);
                match self
                    .store
                    .update(
                        &keys::connector_pk(connector_id),
                        keys::CIRCUIT_BREAKER_SK,
                        update,
                        Condition::AttributeEquals("state".to_string(), json!("OPEN")),
                    )
                    .await
                {
                    Ok(_) => {
                        info!(connector_id, "circuit half-open; admitting probe");
                        Ok(Admission::Allowed)
                    }
                    // Someone else claimed the transition first.
                    Err(StoreError::ConditionFailed) => Ok(Admission::Denied {
                        retry_after_seconds: self.config.cooldown_seconds,
                    }),
                    Err(e) => Err(e),
                }
            }
            BreakerPhase::HalfOpen => {
                if state.half_open_probe_in_flight {
                    return Ok(Admission::Denied {
                        retry_after_seconds: self.config.cooldown_seconds,
                    });
                }
                let update = Update::default()
                    .set("half_open_probe_in_flight", json!(true))
                    .ttl(now_epoch + STATE_TTL_SECONDS);
                match self
                    .store
                    .update(
                        &keys::connector_pk(connector_id),
                        keys::CIRCUIT_BREAKER_SK,
                        update,
                        Condition::AttributeEquals(
                            "half_open_probe_in_flight".to_string(),
                            json!(false),
                        ),
                    )
                    .await
                {
                    Ok(_) => Ok(Admission::Allowed),
                    Err(StoreError::ConditionFailed) => Ok(Admission::Denied {
                        retry_after_seconds: self.config.cooldown_seconds,
                    }),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// A call succeeded. Closes the circuit from HALF_OPEN and clears any
    /// accumulated failures.
    pub async fn record_success(
        &self,
        connector_id: &str,
        now_epoch: i64,
    ) -> Result<(), StoreError> {
        let state = self.load(connector_id).await?;
        let needs_reset = match &state {
            Some(s) => s.state != BreakerPhase::Closed || s.failure_count > 0,
            None => false,
        };
        if !needs_reset {
            return Ok(());
        }
        if let Some(s) = &state {
            if s.state != BreakerPhase::Closed {
                info!(connector_id, "circuit closed after successful probe");
            }
        }
        self.save(connector_id, &BreakerState::closed(now_epoch), now_epoch)
            .await
    }

    /// A call failed. Counts within the window; trips to OPEN at the
    /// threshold, and re-opens immediately on a failed HALF_OPEN probe.
    pub async fn record_failure(
        &self,
        connector_id: &str,
        now_epoch: i64,
    ) -> Result<(), StoreError> {
        let mut state = self
            .load(connector_id)
            .await?
            .unwrap_or_else(|| BreakerState::closed(now_epoch));

        if state.state == BreakerPhase::HalfOpen {
            // Failed probe: straight back to OPEN for another cooldown.
            state.state = BreakerPhase::Open;
            state.open_until_epoch = Some(now_epoch + self.config.cooldown_seconds);
            state.half_open_probe_in_flight = false;
            info!(connector_id, "half-open probe failed; circuit re-opened");
            return self.save(connector_id, &state, now_epoch).await;
        }

        if now_epoch - state.window_start_epoch > self.config.window_seconds {
            state.window_start_epoch = now_epoch;
            state.failure_count = 1;
        } else {
            state.failure_count += 1;
        }

        if state.failure_count >= self.config.failure_threshold {
            state.state = BreakerPhase::Open;
            state.open_until_epoch = Some(now_epoch + self.config.cooldown_seconds);
            state.half_open_probe_in_flight = false;
            info!(
                connector_id,
                failure_count = state.failure_count,
                "failure threshold reached; circuit opened"
            );
        }

        self.save(connector_id, &state, now_epoch).await
    }

    async fn load(&self, connector_id: &str) -> Result<Option<BreakerState>, StoreError> {
        let item = self
            .store
            .get(&keys::connector_pk(connector_id), keys::CIRCUIT_BREAKER_SK)
            .await?;
        match item {
            Some(item) => serde_json::from_value(item.body).map(Some).map_err(|e| {
                StoreError::Backend(anyhow::Error::new(e).context("decode breaker state"))
            }),
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        connector_id: &str,
        state: &BreakerState,
        now_epoch: i64,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_value(state).map_err(|e| {
            StoreError::Backend(anyhow::Error::new(e).context("serialize breaker state"))
        })?;
        self.store
            .put(
                Item::new(keys::connector_pk(connector_id), keys::CIRCUIT_BREAKER_SK, body)
                    .with_ttl(now_epoch + STATE_TTL_SECONDS),
                Condition::None,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axp_store::MemoryKvStore;

    fn breaker() -> CircuitBreaker<MemoryKvStore> {
        CircuitBreaker::new(MemoryKvStore::new(), BreakerConfig::default())
    }

    #[tokio::test]
    async fn fresh_connector_is_allowed() {
        let b = breaker();
        assert_eq!(b.allow_request("internal", 1_000).await.unwrap(), Admission::Allowed);
    }

    #[tokio::test]
    async fn five_failures_in_window_trip_open() {
        let b = breaker();
        for i in 0..5 {
            b.record_failure("internal", 1_000 + i).await.unwrap();
        }
        match b.allow_request("internal", 1_010).await.unwrap() {
            Admission::Denied { retry_after_seconds } => {
                assert!(retry_after_seconds >= 1 && retry_after_seconds <= 30);
            }
            Admission::Allowed => panic!("breaker must be open"),
        }
    }

    #[tokio::test]
    async fn window_expiry_resets_the_count() {
        let b = breaker();
        for i in 0..4 {
            b.record_failure("internal", 1_000 + i).await.unwrap();
        }
        // The 5th failure lands far outside the 60 s window: count restarts.
        b.record_failure("internal", 2_000).await.unwrap();
        assert_eq!(b.allow_request("internal", 2_001).await.unwrap(), Admission::Allowed);
    }

    #[tokio::test]
    async fn cooldown_admits_exactly_one_probe() {
        let b = breaker();
        for i in 0..5 {
            b.record_failure("internal", 1_000 + i).await.unwrap();
        }
        // Cooldown (30 s) elapsed at 1040.
        assert_eq!(b.allow_request("internal", 1_040).await.unwrap(), Admission::Allowed);
        // A concurrent second probe is denied while the first is in flight.
        assert!(matches!(
            b.allow_request("internal", 1_041).await.unwrap(),
            Admission::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn successful_probe_closes_the_circuit() {
        let b = breaker();
        for i in 0..5 {
            b.record_failure("internal", 1_000 + i).await.unwrap();
        }
        assert_eq!(b.allow_request("internal", 1_040).await.unwrap(), Admission::Allowed);
        b.record_success("internal", 1_041).await.unwrap();
        assert_eq!(b.allow_request("internal", 1_042).await.unwrap(), Admission::Allowed);
        assert_eq!(b.allow_request("internal", 1_043).await.unwrap(), Admission::Allowed);
    }

    #[tokio::test]
    async fn failed_probe_reopens_for_another_cooldown() {
        let b = breaker();
        for i in 0..5 {
            b.record_failure("internal", 1_000 + i).await.unwrap();
        }
        assert_eq!(b.allow_request("internal", 1_040).await.unwrap(), Admission::Allowed);
        b.record_failure("internal", 1_041).await.unwrap();

        match b.allow_request("internal", 1_042).await.unwrap() {
            Admission::Denied { retry_after_seconds } => assert!(retry_after_seconds > 0),
            Admission::Allowed => panic!("circuit must have re-opened"),
        }
        // After the second cooldown, a probe is admitted again.
        assert_eq!(b.allow_request("internal", 1_072).await.unwrap(), Admission::Allowed);
    }

    #[tokio::test]
    async fn breakers_are_per_connector() {
        let b = breaker();
        for i in 0..5 {
            b.record_failure("crm_salesforce", 1_000 + i).await.unwrap();
        }
        assert!(matches!(
            b.allow_request("crm_salesforce", 1_010).await.unwrap(),
            Admission::Denied { .. }
        ));
        assert_eq!(b.allow_request("internal", 1_010).await.unwrap(), Admission::Allowed);
    }
}
