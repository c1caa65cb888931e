//! Error taxonomy shared by every Engage crate.

use serde::Serialize;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, EngageError>;

#[derive(Debug, thiserror::Error)]
pub enum EngageError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} is inactive")]
    Inactive(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("unknown trigger service: {0}")]
    UnknownTriggerService(String),

    #[error("unknown action service: {0}")]
    UnknownActionService(String),

    #[error("delivery failed: {0}")]
    ExternalDelivery(String),

    #[error("scheduling unavailable: {0}")]
    SchedulingUnavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl EngageError {
    /// Stable code surfaced to management API callers.
    pub fn code(&self) -> &'static str {
        match self {
            EngageError::NotFound(_) => "NOT_FOUND",
            EngageError::Inactive(_) => "INACTIVE",
            EngageError::InvalidState(_) => "INVALID_STATE",
            EngageError::ValidationFailed(_) | EngageError::InvalidDefinition(_) => {
                "VALIDATION_FAILED"
            }
            EngageError::UnknownTriggerService(_) | EngageError::UnknownActionService(_) => {
                "UNKNOWN_SERVICE"
            }
            EngageError::ExternalDelivery(_) => "EXTERNAL_DELIVERY_ERROR",
            EngageError::SchedulingUnavailable(_) => "SCHEDULING_UNAVAILABLE",
            _ => "INTERNAL_ERROR",
        }
    }

    pub fn not_found(what: &str, id: &str) -> Self {
        EngageError::NotFound(format!("{what} '{id}'"))
    }
}

/// `{code, message}` body returned by the management surface.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&EngageError> for ErrorBody {
    fn from(err: &EngageError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(EngageError::not_found("campaign", "c1").code(), "NOT_FOUND");
        assert_eq!(
            EngageError::UnknownActionService("x".into()).code(),
            "UNKNOWN_SERVICE"
        );
        assert_eq!(EngageError::Database("locked".into()).code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_error_body() {
        let err = EngageError::InvalidState("campaign is sent".into());
        let body = ErrorBody::from(&err);
        assert_eq!(body.code, "INVALID_STATE");
        assert_eq!(body.message, "invalid state: campaign is sent");
    }
}
