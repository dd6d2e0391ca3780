//! Store paths and the layout of journaltogether data
//!
//! ```text
//! users/{uid}/groups/{gid} = true        membership index
//! groups/{gid}             = Group       group document
//! invitations/{iid}        = Invitation  invitation record
//! ```

use super::errors::{StoreError, StoreResult};
use crate::model::types::{GroupId, InvitationId, UserId};
use crate::model::validation::validate_path_segment;
use std::fmt;

/// A `/`-separated location in the remote store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath(Vec<String>);

impl StorePath {
    /// The empty path
    pub fn root() -> Self {
        StorePath(Vec::new())
    }

    /// Parse `a/b/c`; leading and trailing separators are ignored
    pub fn parse(raw: &str) -> StoreResult<Self> {
        let mut path = StorePath::root();
        for segment in raw.split('/').filter(|s| !s.is_empty()) {
            path = path.child(segment)?;
        }
        Ok(path)
    }

    /// Append one validated segment
    pub fn child(&self, segment: &str) -> StoreResult<Self> {
        validate_path_segment(segment).map_err(|e| StoreError::InvalidPath(e.to_string()))?;
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Ok(StorePath(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// True if `self` equals `other` or is one of its ancestors
    pub fn contains(&self, other: &StorePath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// `users/{uid}/groups`
pub fn user_groups(user_id: &UserId) -> StoreResult<StorePath> {
    StorePath::root().child("users")?.child(user_id.as_str())?.child("groups")
}

/// `users/{uid}/groups/{gid}`
pub fn user_group_entry(user_id: &UserId, group_id: &GroupId) -> StoreResult<StorePath> {
    user_groups(user_id)?.child(group_id.as_str())
}

/// `groups/{gid}`
pub fn group(group_id: &GroupId) -> StoreResult<StorePath> {
    StorePath::root().child("groups")?.child(group_id.as_str())
}

/// `groups/{gid}/members`
pub fn group_members(group_id: &GroupId) -> StoreResult<StorePath> {
    group(group_id)?.child("members")
}

/// `groups/{gid}/members/{uid}`
pub fn group_member(group_id: &GroupId, user_id: &UserId) -> StoreResult<StorePath> {
    group_members(group_id)?.child(user_id.as_str())
}

/// `invitations/{iid}`
pub fn invitation(invitation_id: &InvitationId) -> StoreResult<StorePath> {
    StorePath::root().child("invitations")?.child(invitation_id.as_str())
}
