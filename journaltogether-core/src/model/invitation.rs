//! Group invitations

use super::types::{GroupId, InvitationId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// An invitation record, stored at `invitations/{id}`
///
/// Recording an invitation does not add the invitee to the group; acceptance
/// happens through a separate flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: InvitationId,
    pub group_id: GroupId,
    pub group_name: String,
    pub email: String,
    pub invited_by: UserId,
    pub created_at: Timestamp,
}

impl Invitation {
    pub fn new(group_id: GroupId, group_name: String, email: String, invited_by: UserId) -> Self {
        Invitation {
            id: InvitationId::generate(),
            group_id,
            group_name,
            email,
            invited_by,
            created_at: Timestamp::now(),
        }
    }
}
