//! Per-group subscription slots

use crate::model::types::{GroupId, UserId};
use crate::model::{Group, Member};
use crate::remote::{apply_changes, ChildChange, Children, FeedRegistration};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Shape of `groups/{gid}` as read back from the store.
/// The id is taken from the path, not the document.
#[derive(Deserialize)]
struct GroupDocument {
    name: String,
    #[serde(default)]
    members: BTreeMap<UserId, Member>,
}

/// One slot per indexed group id
///
/// A live slot holds the store registration and a mirror of the group
/// document's children. A failed slot holds neither and waits for its id to
/// leave the index.
#[derive(Debug)]
pub(crate) struct SubscriptionHandle {
    registration: Option<FeedRegistration>,
    document: Children,
}

impl SubscriptionHandle {
    pub(crate) fn live(registration: FeedRegistration) -> Self {
        Self {
            registration: Some(registration),
            document: Children::new(),
        }
    }

    pub(crate) fn failed() -> Self {
        Self {
            registration: None,
            document: Children::new(),
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.registration
            .as_ref()
            .map(FeedRegistration::is_active)
            .unwrap_or(false)
    }

    pub(crate) fn replace(&mut self, children: Children) {
        self.document = children;
    }

    pub(crate) fn apply(&mut self, changes: &[ChildChange]) {
        apply_changes(&mut self.document, changes);
    }

    /// Cancel the registration and forget the mirrored document
    pub(crate) fn close(&mut self) {
        if let Some(mut registration) = self.registration.take() {
            registration.cancel();
        }
        self.document.clear();
    }

    /// Decode the mirrored document. `Ok(None)` means no document exists.
    pub(crate) fn decode(&self, group_id: &GroupId) -> Result<Option<Group>, serde_json::Error> {
        if self.document.is_empty() {
            return Ok(None);
        }
        let object: Map<String, Value> = self
            .document
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let document: GroupDocument = serde_json::from_value(Value::Object(object))?;
        Ok(Some(Group {
            id: group_id.clone(),
            name: document.name,
            members: document.members,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::StorePath;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn children(value: Value) -> Children {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => Children::new(),
        }
    }

    #[test]
    fn test_decode_uses_path_id() {
        let mut handle = SubscriptionHandle::failed();
        handle.replace(children(json!({
            "id": "stale",
            "name": "Family",
            "members": { "u1": { "email": "a@example.com" } }
        })));

        let group = handle.decode(&GroupId::new("g1")).unwrap().unwrap();
        assert_eq!(group.id, GroupId::new("g1"));
        assert_eq!(group.name, "Family");
        assert!(group.is_member(&UserId::new("u1")));
    }

    #[test]
    fn test_empty_document_is_absent() {
        let handle = SubscriptionHandle::failed();
        assert!(handle.decode(&GroupId::new("g1")).unwrap().is_none());
    }

    #[test]
    fn test_malformed_document_is_an_error() {
        let mut handle = SubscriptionHandle::failed();
        handle.replace(children(json!({ "name": 42 })));
        assert!(handle.decode(&GroupId::new("g1")).is_err());
    }

    #[test]
    fn test_apply_member_removal() {
        let mut handle = SubscriptionHandle::failed();
        handle.replace(children(json!({
            "name": "Family",
            "members": {
                "u1": { "email": "a@example.com" },
                "u2": { "email": "b@example.com" }
            }
        })));
        handle.apply(&[ChildChange::Changed {
            key: "members".into(),
            value: json!({ "u1": { "email": "a@example.com" } }),
        }]);

        let group = handle.decode(&GroupId::new("g1")).unwrap().unwrap();
        assert_eq!(group.member_count(), 1);
    }

    #[test]
    fn test_close_cancels_registration() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let registration = FeedRegistration::new(7, StorePath::root(), move || {
            flag.store(true, Ordering::SeqCst);
        });

        let mut handle = SubscriptionHandle::live(registration);
        assert!(handle.is_live());

        handle.close();
        assert!(!handle.is_live());
        assert!(cancelled.load(Ordering::SeqCst));
    }
}
