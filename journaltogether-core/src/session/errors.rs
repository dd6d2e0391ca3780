//! Error types for session bootstrap and its collaborators

use crate::model::ValidationError;
use thiserror::Error;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced to callers of the session bootstrap
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Input rejected before any network call
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The application server rejected the code (expired, already used, malformed)
    #[error("Invalid code: {0}")]
    InvalidCode(String),

    /// The auth service rejected the session credential
    #[error("Session redemption failed: {0}")]
    SessionRedemptionFailed(String),

    /// The application server refused a code request
    #[error("Request rejected: {0}")]
    RequestRejected(String),

    /// Transient failure reaching a remote service
    #[error("Network error: {0}")]
    Network(String),

    /// The operation needs a signed-in session
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The identity signal was dropped
    #[error("Identity signal closed")]
    SignalClosed,
}

impl SessionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::Network(_))
    }
}

/// Errors returned by the application server collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppServerError {
    /// A 4xx-style rejection
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Missing or invalid access token
    #[error("Unauthorized")]
    Unauthorized,

    /// The server could not be reached
    #[error("Server unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by the auth service collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Credential rejected: {0}")]
    Rejected(String),

    #[error("No active session")]
    NoSession,

    #[error("Auth service unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SessionError::InvalidCode("code already used".to_string());
        assert_eq!(err.to_string(), "Invalid code: code already used");

        let err: SessionError = ValidationError::InvalidEmail("x".to_string()).into();
        assert!(matches!(err, SessionError::Validation(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(SessionError::Network("timeout".into()).is_transient());
        assert!(!SessionError::InvalidCode("used".into()).is_transient());
    }
}
