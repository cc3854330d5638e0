//! Shared daemon state: the store-backed read paths and build metadata.

use std::sync::Arc;

use axp_execution::{AttemptStore, IntentStore, OutcomeStore};
use axp_store::KvStore;

#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            service: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

pub struct AppState {
    pub intents: IntentStore<Arc<dyn KvStore>>,
    pub attempts: AttemptStore<Arc<dyn KvStore>>,
    pub outcomes: OutcomeStore<Arc<dyn KvStore>>,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            intents: IntentStore::new(store.clone()),
            attempts: AttemptStore::new(store.clone()),
            outcomes: OutcomeStore::new(store),
            build: BuildInfo::current(),
        }
    }
}
