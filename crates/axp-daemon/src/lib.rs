//! Read-only status API for the execution pipeline.
//!
//! Two query endpoints (single-execution status, per-account outcome list)
//! plus liveness. Tenancy comes exclusively from the verified bearer
//! claims; header-supplied tenant values are never trusted.

pub mod api_types;
pub mod claims;
pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
