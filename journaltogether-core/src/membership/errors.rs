//! Membership error types

use crate::model::types::{GroupId, InvitationId, UserId};
use crate::model::ValidationError;
use crate::remote::StoreError;
use thiserror::Error;

/// Result type for membership operations
pub type MembershipResult<T> = Result<T, MembershipError>;

/// Membership operation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Reconciler not started")]
    NotStarted,

    #[error("Reconciler already started; stop it before starting again")]
    AlreadyStarted,

    #[error("Reconciler task has stopped")]
    Stopped,

    #[error("Group not found: {0}")]
    GroupNotFound(GroupId),

    #[error("Member not found in group {group}: {member}")]
    MemberNotFound { group: GroupId, member: UserId },

    #[error("Cannot remove the last member of group {0}; delete the group instead")]
    LastMember(GroupId),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invitation {invitation_id} was recorded but delivery failed: {reason}")]
    InviteDeliveryFailed {
        invitation_id: InvitationId,
        reason: String,
    },

    /// The group changed between the read and the write; nothing was written
    #[error("Concurrent change to {0}; reload and retry")]
    Conflict(String),

    #[error("Inconsistent reconciler state: {0}")]
    InconsistentState(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for MembershipError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => MembershipError::Network(msg),
            StoreError::PermissionDenied(path) => MembershipError::PermissionDenied(path),
            StoreError::Conflict(path) => MembershipError::Conflict(path),
            other => MembershipError::Store(other),
        }
    }
}

impl From<serde_json::Error> for MembershipError {
    fn from(e: serde_json::Error) -> Self {
        MembershipError::Store(StoreError::from(e))
    }
}
