//! Published membership snapshots

use super::errors::{MembershipError, MembershipResult};
use crate::model::types::{GroupId, UserId};
use crate::model::Group;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;

/// Where the reconciler is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SnapshotStatus {
    /// No identity; nothing is tracked
    #[default]
    Idle,
    /// Index subscription opened, first value pending
    Loading,
    /// Index is live
    Live,
    /// The index subscription was lost or an invariant broke.
    /// `groups` holds the last known state and must not be read as "no groups".
    Failed(MembershipError),
}

/// Read-only view of every tracked group at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub status: SnapshotStatus,
    pub user: Option<UserId>,
    /// Group ids currently in the membership index
    pub index: BTreeSet<GroupId>,
    /// Loaded group documents; always a subset of `index` while live
    pub groups: BTreeMap<GroupId, Group>,
    /// Per-group feed failures, reported once per subscription
    pub group_errors: BTreeMap<GroupId, MembershipError>,
}

impl Snapshot {
    pub fn is_live(&self) -> bool {
        self.status == SnapshotStatus::Live
    }

    pub fn error(&self) -> Option<&MembershipError> {
        match &self.status {
            SnapshotStatus::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Ids in the index whose document has not arrived and has not failed
    pub fn pending(&self) -> impl Iterator<Item = &GroupId> {
        self.index
            .iter()
            .filter(|id| !self.groups.contains_key(*id) && !self.group_errors.contains_key(*id))
    }

    pub fn group(&self, id: &GroupId) -> Option<&Group> {
        self.groups.get(id)
    }
}

/// Receiver side of the snapshot signal. Dropping it unsubscribes.
#[derive(Debug, Clone)]
pub struct SnapshotWatch {
    rx: watch::Receiver<Arc<Snapshot>>,
}

impl SnapshotWatch {
    pub(crate) fn new(rx: watch::Receiver<Arc<Snapshot>>) -> Self {
        Self { rx }
    }

    /// Current snapshot, marking it as seen
    pub fn current(&mut self) -> Arc<Snapshot> {
        self.rx.borrow_and_update().clone()
    }

    /// True if a snapshot was published since the last `current`/`changed`
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Wait for the next published snapshot
    pub async fn changed(&mut self) -> MembershipResult<Arc<Snapshot>> {
        self.rx.changed().await.map_err(|_| MembershipError::Stopped)?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Wait until a snapshot satisfies `predicate`, checking the current one first
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&Snapshot) -> bool,
    ) -> MembershipResult<Arc<Snapshot>> {
        let snapshot = self
            .rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| MembershipError::Stopped)?;
        Ok(snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_excludes_loaded_and_failed() {
        let mut snapshot = Snapshot::default();
        let user = UserId::new("u1");
        for id in ["a", "b", "c"] {
            snapshot.index.insert(GroupId::new(id));
        }
        snapshot.groups.insert(
            GroupId::new("a"),
            Group::new(GroupId::new("a"), "A".into(), &user, "u1@example.com"),
        );
        snapshot
            .group_errors
            .insert(GroupId::new("b"), MembershipError::PermissionDenied("groups/b".into()));

        let pending: Vec<_> = snapshot.pending().cloned().collect();
        assert_eq!(pending, vec![GroupId::new("c")]);
    }

    #[test]
    fn test_failed_status_is_distinct_from_empty() {
        let empty = Snapshot {
            status: SnapshotStatus::Live,
            ..Default::default()
        };
        let failed = Snapshot {
            status: SnapshotStatus::Failed(MembershipError::Network("gone".into())),
            ..Default::default()
        };

        assert!(empty.is_live() && empty.error().is_none());
        assert!(!failed.is_live());
        assert_ne!(empty, failed);
    }

    #[tokio::test]
    async fn test_watch_wait_for() {
        let (tx, rx) = watch::channel(Arc::new(Snapshot::default()));
        let mut watch = SnapshotWatch::new(rx);

        tx.send_replace(Arc::new(Snapshot {
            status: SnapshotStatus::Live,
            ..Default::default()
        }));

        let snapshot = watch.wait_for(|s| s.is_live()).await.unwrap();
        assert!(snapshot.is_live());

        drop(tx);
        assert_eq!(watch.changed().await.unwrap_err(), MembershipError::Stopped);
    }
}
