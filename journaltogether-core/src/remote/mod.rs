//! Remote document/index store
//!
//! The store is push based: a subscription delivers the children of a path
//! once, then one batch of add/change/remove notifications per applied
//! transaction, until the registration is cancelled or the store closes it.
//!
//! ## Key Design Principles
//!
//! 1. Writes are multi-path transactions; no partial state is ever observable
//! 2. Cancelling a [`FeedRegistration`] unregisters the listener before returning
//! 3. A feed that the store terminates ends with exactly one [`FeedEvent::Closed`]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc;

pub mod errors;
pub mod memory_store;
pub mod path;

pub use errors::{StoreError, StoreResult};
pub use memory_store::MemoryStore;
pub use path::StorePath;

/// Children of a path, keyed by child segment
pub type Children = BTreeMap<String, Value>;

/// One incremental change to the children of a subscribed path
#[derive(Debug, Clone, PartialEq)]
pub enum ChildChange {
    Added { key: String, value: Value },
    Changed { key: String, value: Value },
    Removed { key: String },
}

impl ChildChange {
    pub fn key(&self) -> &str {
        match self {
            ChildChange::Added { key, .. }
            | ChildChange::Changed { key, .. }
            | ChildChange::Removed { key } => key,
        }
    }
}

/// Notifications delivered on a live feed
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Current children at subscription time; always the first event
    Initial(Children),
    /// All changes caused by one transaction
    Batch(Vec<ChildChange>),
    /// The store terminated the feed; nothing follows
    Closed(StoreError),
}

/// Apply a batch of changes to a local copy of the children
pub fn apply_changes(children: &mut Children, changes: &[ChildChange]) {
    for change in changes {
        match change {
            ChildChange::Added { key, value } | ChildChange::Changed { key, value } => {
                children.insert(key.clone(), value.clone());
            }
            ChildChange::Removed { key } => {
                children.remove(key);
            }
        }
    }
}

/// Registration of a live listener
///
/// Cancelling (explicitly or by drop) unregisters the listener synchronously.
pub struct FeedRegistration {
    id: u64,
    path: StorePath,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl FeedRegistration {
    pub fn new(id: u64, path: StorePath, cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            path,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    /// Unregister the listener. Later calls are no-ops.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for FeedRegistration {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for FeedRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedRegistration")
            .field("id", &self.id)
            .field("path", &self.path.to_string())
            .field("active", &self.is_active())
            .finish()
    }
}

/// A live subscription: the event receiver plus the registration that keeps it open
#[derive(Debug)]
pub struct Feed {
    pub events: mpsc::UnboundedReceiver<FeedEvent>,
    pub registration: FeedRegistration,
}

/// A set of writes applied atomically; `None` removes the path
///
/// Preconditions added with [`Transaction::require`] are checked against the
/// current tree in the same step; if any differs nothing is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    writes: BTreeMap<StorePath, Option<Value>>,
    expected: BTreeMap<StorePath, Option<Value>>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: StorePath, value: Value) -> Self {
        self.writes.insert(path, Some(value));
        self
    }

    pub fn remove(mut self, path: StorePath) -> Self {
        self.writes.insert(path, None);
        self
    }

    /// Only commit if `path` currently holds `value` (`None`: nothing there)
    pub fn require(mut self, path: StorePath, value: Option<Value>) -> Self {
        self.expected.insert(path, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn writes(&self) -> &BTreeMap<StorePath, Option<Value>> {
        &self.writes
    }

    pub fn preconditions(&self) -> &BTreeMap<StorePath, Option<Value>> {
        &self.expected
    }

    /// Reject transactions in which one path is an ancestor of another
    pub fn check_disjoint(&self) -> StoreResult<()> {
        let paths: Vec<&StorePath> = self.writes.keys().collect();
        for (i, a) in paths.iter().enumerate() {
            for b in &paths[i + 1..] {
                if a.contains(b) || b.contains(a) {
                    return Err(StoreError::InvalidTransaction(format!(
                        "overlapping paths {} and {}",
                        a, b
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The remote document/index store collaborator
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Point read of the value at `path`
    async fn read(&self, path: &StorePath) -> StoreResult<Option<Value>>;

    /// Register a live listener on the children of `path`
    fn subscribe(&self, path: &StorePath) -> StoreResult<Feed>;

    /// Apply all writes atomically, or none of them if a precondition fails
    async fn transact(&self, transaction: Transaction) -> StoreResult<()>;
}
