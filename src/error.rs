//! Typed error surface for the back-office engine.
//!
//! Every operation returns a discriminated result; nothing panics or throws
//! across the boundary. Variants carry the structured payload a caller needs
//! for remediation (unmet checklist keys, the variance that demanded a
//! reason), and `kind()` gives a stable discriminant for wire payloads.

use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Operation attempted from a state that forbids it (e.g. closing a
    /// permanently closed session). Not retryable; surfaced to the caller.
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Lost the race on a conditional write. Callers should re-fetch the
    /// current record rather than retry blindly.
    #[error("already closed: {0}")]
    AlreadyClosed(String),

    /// Permanent close submitted a non-zero variance without a reason.
    #[error("cash variance of {variance} requires a variance reason")]
    MissingVarianceReason { variance: Decimal },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("business day not found: {0}")]
    DayNotFound(String),

    /// Carries the unmet checklist keys so the operator can remediate and
    /// resubmit. Not an infrastructure failure.
    #[error("checklist incomplete: {}", .0.join(", "))]
    ChecklistIncomplete(Vec<String>),

    /// Transient storage failure. Safe to retry idempotently for day close
    /// and read-only queries; session closes must re-check current status
    /// first so a retry cannot double-submit a counted-cash value.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Malformed or incomplete request payload.
    #[error("validation failed: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Stable discriminant used in wire payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidStateTransition(_) => "invalid_state_transition",
            EngineError::AlreadyClosed(_) => "already_closed",
            EngineError::MissingVarianceReason { .. } => "missing_variance_reason",
            EngineError::SessionNotFound(_) => "session_not_found",
            EngineError::DayNotFound(_) => "day_not_found",
            EngineError::ChecklistIncomplete(_) => "checklist_incomplete",
            EngineError::StorageUnavailable(_) => "storage_unavailable",
            EngineError::Validation(_) => "validation",
        }
    }

    /// Structured error payload for callers. Remediation data rides along:
    /// the unmet checklist keys, or the variance that needs a reason.
    pub fn to_value(&self) -> Value {
        let mut payload = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        match self {
            EngineError::ChecklistIncomplete(missing) => {
                payload["missingChecks"] = serde_json::json!(missing);
            }
            EngineError::MissingVarianceReason { variance } => {
                payload["variance"] = serde_json::json!(variance.to_string());
            }
            _ => {}
        }
        payload
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::StorageUnavailable(e.to_string())
    }
}
