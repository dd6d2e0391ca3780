//! Signed-in identity

use super::types::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The identity of the signed-in user
///
/// Replaced wholesale on sign-in, token refresh and sign-out; never mutated in place.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub email: String,
    pub session_token: String,
}

impl Identity {
    pub fn new(id: UserId, email: impl Into<String>, session_token: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            session_token: session_token.into(),
        }
    }
}

// Keep session tokens out of logs.
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("session_token", &"<redacted>")
            .finish()
    }
}

/// Current authentication state as published by the session bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// Not yet resolved; only seen before the first restore or sign-in completes
    Unknown,
    Unauthenticated,
    Authenticated(Identity),
}

impl AuthState {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            AuthState::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, AuthState::Unknown)
    }
}
