//! Execution records: the attempt lock, the write-once outcome store, and
//! the read-only intent view.
//!
//! Exactly-once semantics rest entirely on the store's conditional writes.
//! No in-process mutex is held anywhere, so correctness is unchanged on any
//! worker topology.

mod attempts;
mod intents;
mod outcomes;

pub use attempts::{
    AttemptError, AttemptStore, StartAttemptArgs, TerminalStatus,
    DEFAULT_ORCHESTRATION_TIMEOUT_SECONDS,
};
pub use intents::IntentStore;
pub use outcomes::{OutcomeError, OutcomeStore};
