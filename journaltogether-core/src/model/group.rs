//! Group documents

use super::types::{GroupId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A group member entry as stored inside the group document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub email: String,
}

/// A journaling group
///
/// Stored at `groups/{id}`. A live group always has at least one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub members: BTreeMap<UserId, Member>,
}

impl Group {
    /// Create a new group with `creator` as its sole member
    pub fn new(id: GroupId, name: String, creator: &UserId, creator_email: &str) -> Self {
        let mut members = BTreeMap::new();
        members.insert(
            creator.clone(),
            Member {
                email: creator_email.to_string(),
            },
        );
        Group { id, name, members }
    }

    pub fn is_member(&self, user_id: &UserId) -> bool {
        self.members.contains_key(user_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}
