//! Per-connector concurrency limits.
//!
//! A plain semaphore per connector with owned permits: the permit is an
//! RAII guard, so release happens on every exit path: success, error, or
//! worker teardown mid-call. Over-limit callers get a deferral with a
//! caller-visible retry hint rather than queuing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct ConcurrencyLimiter {
    default_capacity: usize,
    retry_after_seconds: i64,
    per_connector: BTreeMap<String, usize>,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConcurrencyLimiter {
    pub fn new(default_capacity: usize, retry_after_seconds: i64) -> Self {
        Self {
            default_capacity,
            retry_after_seconds,
            per_connector: BTreeMap::new(),
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// Per-connector capacity overrides (from configuration).
    pub fn with_connector_capacities(mut self, capacities: BTreeMap<String, usize>) -> Self {
        self.per_connector = capacities;
        self
    }

    /// The retry hint handed back on deferral.
    pub fn retry_after_seconds(&self) -> i64 {
        self.retry_after_seconds
    }

    /// Take a token for a connector, or `None` when the connector is at
    /// capacity. Dropping the permit releases the token.
    pub fn try_acquire(&self, connector_id: &str) -> Option<OwnedSemaphorePermit> {
        let sem = {
            let mut map = self.semaphores.lock().expect("limiter mutex poisoned");
            map.entry(connector_id.to_string())
                .or_insert_with(|| {
                    let capacity = self
                        .per_connector
                        .get(connector_id)
                        .copied()
                        .unwrap_or(self.default_capacity);
                    Arc::new(Semaphore::new(capacity))
                })
                .clone()
        };
        sem.try_acquire_owned().ok()
    }
}
