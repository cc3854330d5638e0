//! Pre-tool failure classification.
//!
//! Classification is substring-based over the uppercased `(Error, Cause)`
//! strings the orchestration runtime attaches to a failed step. In-tool
//! failures never pass through here; the adapter's own classification is
//! preserved unchanged at RecordOutcome.

use axp_schemas::{ErrorClass, ErrorShape};

/// Validation-class code for an intent missing its registry version at
/// Start.
pub const CODE_MISSING_REGISTRY_VERSION: &str = "MISSING_REGISTRY_VERSION";
/// Forced classification code synthesized by failure recording when the
/// intent carries no registry version.
pub const CODE_REGISTRY_VERSION_MISSING: &str = "REGISTRY_VERSION_MISSING";
pub const CODE_TOOL_MAPPING_NOT_FOUND: &str = "TOOL_MAPPING_NOT_FOUND";
pub const CODE_MISSING_REQUIRED_PARAMETER: &str = "MISSING_REQUIRED_PARAMETER";
pub const CODE_TOOL_ARGUMENTS_OVERSIZE: &str = "TOOL_ARGUMENTS_OVERSIZE";

const VALIDATION_MARKERS: &[&str] = &[
    "VALIDATION",
    "INTENT_NOT_FOUND",
    "INTENT_EXPIRED",
    "KILL_SWITCH",
    "CONFIGURATION",
];

/// Classify a failed step from its error shape.
pub fn classify_failure(error: &ErrorShape) -> ErrorClass {
    let haystack = format!(
        "{} {}",
        error.error.as_deref().unwrap_or(""),
        error.cause.as_deref().unwrap_or("")
    )
    .to_uppercase();

    if VALIDATION_MARKERS.iter().any(|m| haystack.contains(m)) {
        return ErrorClass::Validation;
    }
    // "AUTH" also covers "AUTHENTICATION" / "AUTHORIZATION".
    if haystack.contains("AUTH") {
        return ErrorClass::Auth;
    }
    ErrorClass::Unknown
}
