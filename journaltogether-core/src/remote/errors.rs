//! Remote store error types

use thiserror::Error;

/// Result type for remote store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reported by the remote document/index store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached; callers may retry at their discretion
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    /// The store refused access to a path
    #[error("Permission denied at {0}")]
    PermissionDenied(String),

    /// A path failed validation
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// The transaction was malformed (e.g. overlapping paths)
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// A precondition did not hold; nothing was written
    #[error("Conflicting write at {0}")]
    Conflict(String),

    /// A stored document could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Transient errors are the only ones worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::PermissionDenied("groups/g1".to_string());
        assert_eq!(err.to_string(), "Permission denied at groups/g1");
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Unavailable("offline".into()).is_transient());
        assert!(!StoreError::PermissionDenied("x".into()).is_transient());
    }

    #[test]
    fn test_error_conversions() {
        let json_err = serde_json::from_str::<String>("invalid json").unwrap_err();
        let err: StoreError = json_err.into();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
