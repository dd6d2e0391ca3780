//! In-memory remote store
//!
//! A JSON tree with path-addressed listeners. Used by tests and the CLI demo,
//! and as the reference behaviour for the [`RemoteStore`] contract: every
//! transaction is applied in full before any listener hears about it, and each
//! listener receives at most one batch per transaction.

use super::{
    ChildChange, Children, Feed, FeedEvent, FeedRegistration, RemoteStore, StoreError,
    StorePath, StoreResult, Transaction,
};
use async_trait::async_trait;
use metrics::counter;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct Listener {
    path: StorePath,
    children: Children,
    tx: mpsc::UnboundedSender<FeedEvent>,
}

struct Inner {
    root: Value,
    listeners: BTreeMap<u64, Listener>,
    next_id: u64,
    online: bool,
    revoked: Vec<StorePath>,
    commits: u64,
}

impl Inner {
    fn check_access(&self, path: &StorePath) -> StoreResult<()> {
        if !self.online {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        if self.revoked.iter().any(|revoked| revoked.contains(path)) {
            return Err(StoreError::PermissionDenied(path.to_string()));
        }
        Ok(())
    }

    fn close_feeds(&mut self, scope: &StorePath, error: &StoreError) -> usize {
        let doomed: Vec<u64> = self
            .listeners
            .iter()
            .filter(|(_, listener)| scope.contains(&listener.path))
            .map(|(id, _)| *id)
            .collect();

        for id in &doomed {
            if let Some(listener) = self.listeners.remove(id) {
                let _ = listener.tx.send(FeedEvent::Closed(error.clone()));
            }
        }
        doomed.len()
    }

    fn notify(&mut self) {
        let Inner { root, listeners, .. } = self;
        let mut disconnected = Vec::new();

        for (id, listener) in listeners.iter_mut() {
            let current = children_of(root, &listener.path);
            let changes = diff_children(&listener.children, &current);
            if changes.is_empty() {
                continue;
            }
            listener.children = current;
            if listener.tx.send(FeedEvent::Batch(changes)).is_err() {
                disconnected.push(*id);
            }
        }

        for id in disconnected {
            warn!(listener = id, "Dropping listener whose receiver is gone");
            listeners.remove(&id);
        }
    }
}

/// In-memory implementation of [`RemoteStore`]
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    /// Create an empty, online store
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                root: Value::Object(Map::new()),
                listeners: BTreeMap::new(),
                next_id: 1,
                online: true,
                revoked: Vec::new(),
                commits: 0,
            })),
        }
    }

    /// Create a store holding `root`, which must be a JSON object
    pub fn from_json(root: Value) -> StoreResult<Self> {
        let root = match root {
            Value::Object(_) => normalize(root).unwrap_or_else(|| Value::Object(Map::new())),
            other => {
                return Err(StoreError::Serialization(format!(
                    "store root must be an object, got {}",
                    other
                )))
            }
        };
        let store = Self::new();
        lock(&store.inner).root = root;
        Ok(store)
    }

    /// Simulate losing (or regaining) connectivity. Offline reads, writes and
    /// new subscriptions fail with [`StoreError::Unavailable`].
    pub fn set_online(&self, online: bool) {
        lock(&self.inner).online = online;
    }

    /// Refuse access to everything under `scope`. Live feeds there are closed
    /// with [`StoreError::PermissionDenied`].
    pub fn revoke(&self, scope: &StorePath) -> usize {
        let mut inner = lock(&self.inner);
        inner.revoked.push(scope.clone());
        let error = StoreError::PermissionDenied(scope.to_string());
        let closed = inner.close_feeds(scope, &error);
        debug!(path = %scope, closed, "Revoked access");
        closed
    }

    /// Undo a previous [`MemoryStore::revoke`]
    pub fn restore_access(&self, scope: &StorePath) {
        lock(&self.inner).revoked.retain(|revoked| revoked != scope);
    }

    /// Terminate every live feed under `scope` with `error`
    pub fn fail_feeds(&self, scope: &StorePath, error: StoreError) -> usize {
        lock(&self.inner).close_feeds(scope, &error)
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    /// Number of listeners registered exactly on `path`
    pub fn listeners_on(&self, path: &StorePath) -> usize {
        lock(&self.inner)
            .listeners
            .values()
            .filter(|listener| &listener.path == path)
            .count()
    }

    /// Number of transactions applied so far
    pub fn commit_count(&self) -> u64 {
        lock(&self.inner).commits
    }

    /// Current value at `path`, ignoring connectivity and access rules
    pub fn get(&self, path: &StorePath) -> Option<Value> {
        value_at(&lock(&self.inner).root, path).cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn read(&self, path: &StorePath) -> StoreResult<Option<Value>> {
        let inner = lock(&self.inner);
        inner.check_access(path)?;
        Ok(value_at(&inner.root, path).cloned())
    }

    fn subscribe(&self, path: &StorePath) -> StoreResult<Feed> {
        let mut inner = lock(&self.inner);
        inner.check_access(path)?;

        let id = inner.next_id;
        inner.next_id += 1;

        let children = children_of(&inner.root, path);
        let (tx, events) = mpsc::unbounded_channel();
        // The receiver is held by the caller, so this cannot fail.
        let _ = tx.send(FeedEvent::Initial(children.clone()));

        inner.listeners.insert(
            id,
            Listener {
                path: path.clone(),
                children,
                tx,
            },
        );
        debug!(listener = id, path = %path, "Listener registered");

        let weak = Arc::downgrade(&self.inner);
        let registration = FeedRegistration::new(id, path.clone(), move || {
            if let Some(inner) = weak.upgrade() {
                if lock(&inner).listeners.remove(&id).is_some() {
                    debug!(listener = id, "Listener cancelled");
                }
            }
        });

        Ok(Feed {
            events,
            registration,
        })
    }

    async fn transact(&self, transaction: Transaction) -> StoreResult<()> {
        transaction.check_disjoint()?;

        let mut inner = lock(&self.inner);
        for path in transaction
            .writes()
            .keys()
            .chain(transaction.preconditions().keys())
        {
            inner.check_access(path)?;
        }

        for (path, expected) in transaction.preconditions() {
            let current = value_at(&inner.root, path);
            if current != expected.clone().and_then(normalize).as_ref() {
                debug!(path = %path, "Transaction precondition failed");
                return Err(StoreError::Conflict(path.to_string()));
            }
        }

        for (path, value) in transaction.writes() {
            match value.clone().and_then(normalize) {
                Some(value) => set_value(&mut inner.root, path.segments(), value),
                None => remove_value(&mut inner.root, path.segments()),
            }
        }
        if !inner.root.is_object() {
            inner.root = Value::Object(Map::new());
        }

        inner.commits += 1;
        counter!("store.transactions").increment(1);
        debug!(writes = transaction.len(), commit = inner.commits, "Transaction applied");

        inner.notify();
        Ok(())
    }
}

fn value_at<'a>(root: &'a Value, path: &StorePath) -> Option<&'a Value> {
    let mut node = root;
    for segment in path.segments() {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

fn children_of(root: &Value, path: &StorePath) -> Children {
    match value_at(root, path) {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => Children::new(),
    }
}

fn diff_children(old: &Children, new: &Children) -> Vec<ChildChange> {
    let mut changes = Vec::new();
    for (key, value) in old {
        match new.get(key) {
            None => changes.push(ChildChange::Removed { key: key.clone() }),
            Some(current) if current != value => changes.push(ChildChange::Changed {
                key: key.clone(),
                value: current.clone(),
            }),
            Some(_) => {}
        }
    }
    for (key, value) in new {
        if !old.contains_key(key) {
            changes.push(ChildChange::Added {
                key: key.clone(),
                value: value.clone(),
            });
        }
    }
    changes.sort_by(|a, b| a.key().cmp(b.key()));
    changes
}

/// Drop nulls and empty objects; `None` means nothing is left to store.
fn normalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let map: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k, v)))
                .collect();
            if map.is_empty() {
                None
            } else {
                Some(Value::Object(map))
            }
        }
        other => Some(other),
    }
}

fn set_value(node: &mut Value, segments: &[String], value: Value) {
    match segments.split_first() {
        None => *node = value,
        Some((head, rest)) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                let child = map.entry(head.clone()).or_insert(Value::Null);
                set_value(child, rest, value);
            }
        }
    }
}

fn remove_value(node: &mut Value, segments: &[String]) {
    let Some((head, rest)) = segments.split_first() else {
        *node = Value::Object(Map::new());
        return;
    };
    if let Value::Object(map) = node {
        if rest.is_empty() {
            map.remove(head);
        } else if let Some(child) = map.get_mut(head) {
            remove_value(child, rest);
            let now_empty = matches!(child, Value::Object(m) if m.is_empty());
            if now_empty {
                map.remove(head);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(raw: &str) -> StorePath {
        StorePath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_delivers_initial_children() {
        let store = MemoryStore::new();
        store
            .transact(Transaction::new().set(path("users/u1/groups/g1"), json!(true)))
            .await
            .unwrap();

        let mut feed = store.subscribe(&path("users/u1/groups")).unwrap();
        let event = feed.events.recv().await.unwrap();

        let mut expected = Children::new();
        expected.insert("g1".to_string(), json!(true));
        assert_eq!(event, FeedEvent::Initial(expected));
    }

    #[tokio::test]
    async fn test_transaction_produces_one_batch() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe(&path("users/u1/groups")).unwrap();
        assert_eq!(feed.events.recv().await.unwrap(), FeedEvent::Initial(Children::new()));

        store
            .transact(
                Transaction::new()
                    .set(path("users/u1/groups/g1"), json!(true))
                    .set(path("users/u1/groups/g2"), json!(true))
                    .set(path("groups/g1"), json!({ "name": "x" })),
            )
            .await
            .unwrap();

        let event = feed.events.recv().await.unwrap();
        assert_eq!(
            event,
            FeedEvent::Batch(vec![
                ChildChange::Added { key: "g1".into(), value: json!(true) },
                ChildChange::Added { key: "g2".into(), value: json!(true) },
            ])
        );
        assert!(feed.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_removal_prunes_empty_parents() {
        let store = MemoryStore::new();
        store
            .transact(Transaction::new().set(path("users/u1/groups/g1"), json!(true)))
            .await
            .unwrap();
        store
            .transact(Transaction::new().remove(path("users/u1/groups/g1")))
            .await
            .unwrap();

        assert_eq!(store.get(&path("users")), None);
        assert_eq!(store.commit_count(), 2);
    }

    #[tokio::test]
    async fn test_unchanged_listener_not_notified() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe(&path("groups/g1")).unwrap();
        feed.events.recv().await.unwrap();

        store
            .transact(Transaction::new().set(path("groups/g2"), json!({ "name": "other" })))
            .await
            .unwrap();

        assert!(feed.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_unregisters_listener() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe(&path("groups/g1")).unwrap();
        assert_eq!(store.listener_count(), 1);

        feed.registration.cancel();
        assert_eq!(store.listener_count(), 0);

        store
            .transact(Transaction::new().set(path("groups/g1/name"), json!("late")))
            .await
            .unwrap();

        feed.events.recv().await.unwrap(); // Initial
        assert!(feed.events.recv().await.is_none(), "feed must end after cancel");
    }

    #[tokio::test]
    async fn test_revoke_closes_feed_and_refuses_access() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe(&path("users/u1/groups")).unwrap();
        feed.events.recv().await.unwrap();

        assert_eq!(store.revoke(&path("users/u1")), 1);
        assert_eq!(
            feed.events.recv().await.unwrap(),
            FeedEvent::Closed(StoreError::PermissionDenied("users/u1".to_string()))
        );
        assert!(feed.events.recv().await.is_none());

        assert!(matches!(
            store.subscribe(&path("users/u1/groups")),
            Err(StoreError::PermissionDenied(_))
        ));
        let write = store
            .transact(Transaction::new().set(path("users/u1/groups/g1"), json!(true)))
            .await;
        assert!(matches!(write, Err(StoreError::PermissionDenied(_))));

        store.restore_access(&path("users/u1"));
        assert!(store.subscribe(&path("users/u1/groups")).is_ok());
    }

    #[tokio::test]
    async fn test_offline_writes_fail_without_partial_application() {
        let store = MemoryStore::new();
        store.set_online(false);

        let result = store
            .transact(Transaction::new().set(path("groups/g1/name"), json!("x")))
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.get(&path("groups")), None);
        assert_eq!(store.commit_count(), 0);

        store.set_online(true);
        assert!(store.read(&path("groups/g1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_denied_path_blocks_whole_transaction() {
        let store = MemoryStore::new();
        store.revoke(&path("groups/locked"));

        let result = store
            .transact(
                Transaction::new()
                    .set(path("groups/open/name"), json!("fine"))
                    .set(path("groups/locked/name"), json!("nope")),
            )
            .await;

        assert!(matches!(result, Err(StoreError::PermissionDenied(_))));
        assert_eq!(store.get(&path("groups/open")), None);
    }

    #[tokio::test]
    async fn test_failed_precondition_writes_nothing() {
        let store = MemoryStore::new();
        store
            .transact(Transaction::new().set(
                path("groups/g1/members"),
                json!({ "u1": {"email": "a"}, "u2": {"email": "b"} }),
            ))
            .await
            .unwrap();
        let mut feed = store.subscribe(&path("groups/g1/members")).unwrap();
        feed.events.recv().await.unwrap();

        let stale = Transaction::new()
            .require(path("groups/g1/members"), Some(json!({ "u1": {"email": "a"} })))
            .remove(path("groups/g1/members/u1"));
        assert_eq!(
            store.transact(stale).await,
            Err(StoreError::Conflict("groups/g1/members".to_string()))
        );
        assert_eq!(store.commit_count(), 1);
        assert!(store.get(&path("groups/g1/members/u1")).is_some());
        assert!(feed.events.try_recv().is_err());

        let current = Transaction::new()
            .require(
                path("groups/g1/members"),
                Some(json!({ "u1": {"email": "a"}, "u2": {"email": "b"} })),
            )
            .require(path("groups/g2"), None)
            .remove(path("groups/g1/members/u1"));
        store.transact(current).await.unwrap();
        assert_eq!(store.get(&path("groups/g1/members/u1")), None);
    }

    #[tokio::test]
    async fn test_from_json_seeds_tree() {
        let store = MemoryStore::from_json(json!({
            "users": { "u1": { "groups": { "g1": true } } },
            "groups": { "g1": { "name": "Seeded", "members": {} } }
        }))
        .unwrap();

        assert_eq!(store.get(&path("users/u1/groups/g1")), Some(json!(true)));
        assert_eq!(store.get(&path("groups/g1")), Some(json!({ "name": "Seeded" })));
        assert!(matches!(
            MemoryStore::from_json(json!([1, 2])),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_normalize_drops_empty_values() {
        assert_eq!(normalize(json!({ "a": null, "b": {} })), None);
        assert_eq!(normalize(json!({ "a": 1, "b": {} })), Some(json!({ "a": 1 })));
    }
}
