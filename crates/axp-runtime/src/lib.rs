//! Execution runtime: the orchestrator state machine, the tool-gateway
//! seam, and pre-tool failure classification.

mod classify;
mod gateway;
mod orchestrator;

pub use classify::{
    classify_failure, CODE_MISSING_REGISTRY_VERSION, CODE_MISSING_REQUIRED_PARAMETER,
    CODE_REGISTRY_VERSION_MISSING, CODE_TOOL_ARGUMENTS_OVERSIZE, CODE_TOOL_MAPPING_NOT_FOUND,
};
pub use gateway::{
    DedupingGateway, HttpToolGateway, ToolGateway, METRIC_IDEMPOTENCY_COLLISION,
};
pub use orchestrator::{CompensationResult, Orchestrator, StepError};
