//! Configuration error types

use thiserror::Error;

/// Errors raised while loading, overriding, validating or saving a
/// [`Config`](super::Config)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The TOML config or the store seed file could not be read
    #[error("Cannot read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Cannot write {path}: {reason}")]
    Write { path: String, reason: String },

    /// The TOML config or the JSON seed file is malformed
    #[error("Cannot parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Cannot render configuration as TOML: {0}")]
    Render(String),

    /// A `JOURNALTOGETHER_*` variable holds an unusable value
    #[error("{var} is not a valid {expected}: {reason}")]
    Env {
        var: String,
        expected: &'static str,
        reason: String,
    },

    /// The seed file parsed but is not a store tree
    #[error("Store seed rejected: {0}")]
    Seed(String),

    /// A setting is out of range
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
