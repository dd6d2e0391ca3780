//! Membership reconciler
//!
//! Keeps one live group subscription per id in the signed-in user's
//! membership index and publishes the merged view as a [`Snapshot`].
//!
//! All state is owned by a single task. Commands and every feed are consumed
//! by one biased `select!` loop with commands first, so a `stop` that has
//! been acknowledged is never followed by a feed event touching the snapshot.

use super::errors::{MembershipError, MembershipResult};
use super::handle::SubscriptionHandle;
use super::snapshot::{Snapshot, SnapshotStatus, SnapshotWatch};
use crate::config::MembershipConfig;
use crate::model::types::{GroupId, UserId};
use crate::model::Identity;
use crate::remote::{
    apply_changes, path, Children, FeedEvent, FeedRegistration, RemoteStore, StoreError,
};
use crate::session::AppServer;
use metrics::{counter, gauge};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt, StreamMap};
use tracing::{debug, error, info, warn};

type GroupStream = Pin<Box<dyn Stream<Item = FeedEvent> + Send>>;

enum Command {
    Start {
        user: UserId,
        ack: oneshot::Sender<MembershipResult<()>>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
}

/// Tracks group membership for one identity at a time
///
/// Must be created inside a tokio runtime. Dropping it stops the task and
/// cancels every registration it holds.
pub struct MembershipReconciler {
    pub(super) store: Arc<dyn RemoteStore>,
    pub(super) app: Arc<dyn AppServer>,
    pub(super) config: MembershipConfig,
    commands: mpsc::UnboundedSender<Command>,
    snapshot_rx: watch::Receiver<Arc<Snapshot>>,
    open_handles: Arc<AtomicUsize>,
    identity: Mutex<Option<Identity>>,
    _task: JoinHandle<()>,
}

impl MembershipReconciler {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        app: Arc<dyn AppServer>,
        config: MembershipConfig,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(Snapshot::default()));
        let open_handles = Arc::new(AtomicUsize::new(0));

        let task = ReconcilerTask {
            store: store.clone(),
            commands: command_rx,
            snapshot_tx,
            open_handles: open_handles.clone(),
            user: None,
            index_feed: None,
            index: Children::new(),
            handles: BTreeMap::new(),
            group_feeds: StreamMap::new(),
            snapshot: Snapshot::default(),
        };

        Self {
            store,
            app,
            config,
            commands,
            snapshot_rx,
            open_handles,
            identity: Mutex::new(None),
            _task: tokio::spawn(task.run()),
        }
    }

    /// Begin tracking the membership index of `identity`
    ///
    /// A store refusal is not returned here; it shows up as a `Failed`
    /// snapshot so that it cannot be mistaken for an empty index.
    pub async fn start(&self, identity: Identity) -> MembershipResult<()> {
        let user = identity.id.clone();
        {
            let mut current = lock(&self.identity);
            if current.is_some() {
                return Err(MembershipError::AlreadyStarted);
            }
            // Set before the task publishes, so operations work as soon as
            // the snapshot names this user.
            *current = Some(identity);
        }

        let (ack, done) = oneshot::channel();
        let result = match self.commands.send(Command::Start { user, ack }) {
            Ok(()) => done.await.unwrap_or(Err(MembershipError::Stopped)),
            Err(_) => Err(MembershipError::Stopped),
        };
        if result.is_err() {
            lock(&self.identity).take();
        }
        result
    }

    /// Close every subscription. Returns once all registrations are cancelled.
    pub async fn stop(&self) {
        lock(&self.identity).take();

        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Stop { ack }).is_ok() {
            let _ = done.await;
        }
    }

    pub fn subscribe_snapshot(&self) -> SnapshotWatch {
        SnapshotWatch::new(self.snapshot_rx.clone())
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// Number of per-group slots as of the last published snapshot
    pub fn open_handle_count(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// The identity passed to the current `start`
    pub fn identity(&self) -> Option<Identity> {
        lock(&self.identity).clone()
    }

    pub(super) fn require_identity(&self) -> MembershipResult<Identity> {
        self.identity().ok_or(MembershipError::NotStarted)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct IndexFeed {
    events: mpsc::UnboundedReceiver<FeedEvent>,
    registration: FeedRegistration,
}

struct ReconcilerTask {
    store: Arc<dyn RemoteStore>,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    open_handles: Arc<AtomicUsize>,
    user: Option<UserId>,
    index_feed: Option<IndexFeed>,
    index: Children,
    handles: BTreeMap<GroupId, SubscriptionHandle>,
    group_feeds: StreamMap<GroupId, GroupStream>,
    snapshot: Snapshot,
}

impl ReconcilerTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                event = next_index_event(&mut self.index_feed) => self.on_index_event(event),
                Some((group_id, event)) = self.group_feeds.next() => {
                    self.on_group_event(group_id, event)
                }
            }
        }

        self.close_all();
        debug!("Membership reconciler task exiting");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Start { user, ack } => {
                let _ = ack.send(self.start(user));
            }
            Command::Stop { ack } => {
                self.stop();
                let _ = ack.send(());
            }
        }
    }

    fn start(&mut self, user: UserId) -> MembershipResult<()> {
        if self.user.is_some() {
            return Err(MembershipError::AlreadyStarted);
        }
        info!(user = %user, "Starting membership reconciliation");

        self.snapshot = Snapshot {
            status: SnapshotStatus::Loading,
            user: Some(user.clone()),
            ..Default::default()
        };

        match path::user_groups(&user).and_then(|index_path| self.store.subscribe(&index_path)) {
            Ok(feed) => {
                self.index_feed = Some(IndexFeed {
                    events: feed.events,
                    registration: feed.registration,
                });
            }
            Err(e) => {
                warn!(user = %user, error = %e, "Membership index subscription refused");
                self.snapshot.status = SnapshotStatus::Failed(e.into());
            }
        }

        self.user = Some(user);
        self.publish();
        Ok(())
    }

    fn stop(&mut self) {
        let Some(user) = self.user.take() else {
            return;
        };

        self.close_all();
        self.snapshot = Snapshot::default();
        self.publish();
        info!(user = %user, "Membership reconciliation stopped");
    }

    fn on_index_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Initial(children) => {
                self.index = children;
                self.snapshot.status = SnapshotStatus::Live;
                self.reconcile();
            }
            FeedEvent::Batch(changes) => {
                apply_changes(&mut self.index, &changes);
                self.reconcile();
            }
            FeedEvent::Closed(e) => {
                warn!(error = %e, "Membership index subscription lost");
                self.fail(e.into());
            }
        }
    }

    /// Diff the index against the open slots and publish once
    fn reconcile(&mut self) {
        let wanted: BTreeSet<GroupId> = self
            .index
            .iter()
            .filter(|(_, marker)| is_present(marker))
            .map(|(key, _)| GroupId::new(key.as_str()))
            .collect();

        let stale: Vec<GroupId> = self
            .handles
            .keys()
            .filter(|id| !wanted.contains(*id))
            .cloned()
            .collect();
        for group_id in &stale {
            self.close_handle(group_id);
            self.snapshot.groups.remove(group_id);
            self.snapshot.group_errors.remove(group_id);
        }

        let fresh: Vec<GroupId> = wanted
            .iter()
            .filter(|id| !self.handles.contains_key(*id))
            .cloned()
            .collect();
        for group_id in &fresh {
            self.open_handle(group_id.clone());
        }

        if !stale.is_empty() || !fresh.is_empty() {
            debug!(
                opened = fresh.len(),
                closed = stale.len(),
                total = wanted.len(),
                "Membership index reconciled"
            );
        }

        self.snapshot.index = wanted;
        self.verify_and_publish();
    }

    fn open_handle(&mut self, group_id: GroupId) {
        let handle = match path::group(&group_id).and_then(|p| self.store.subscribe(&p)) {
            Ok(feed) => {
                self.group_feeds
                    .insert(group_id.clone(), group_stream(feed.events));
                SubscriptionHandle::live(feed.registration)
            }
            Err(e) => {
                warn!(group = %group_id, error = %e, "Group subscription refused");
                self.snapshot.group_errors.insert(group_id.clone(), e.into());
                SubscriptionHandle::failed()
            }
        };

        counter!("membership.handles.opened").increment(1);
        self.handles.insert(group_id, handle);
    }

    /// Drop the buffered feed and cancel the registration in one step
    fn close_handle(&mut self, group_id: &GroupId) {
        self.group_feeds.remove(group_id);
        if let Some(mut handle) = self.handles.remove(group_id) {
            handle.close();
            counter!("membership.handles.closed").increment(1);
        }
    }

    fn close_all(&mut self) {
        let open: Vec<GroupId> = self.handles.keys().cloned().collect();
        for group_id in &open {
            self.close_handle(group_id);
        }
        if let Some(mut feed) = self.index_feed.take() {
            feed.events.close();
            feed.registration.cancel();
        }
        self.index.clear();
    }

    fn on_group_event(&mut self, group_id: GroupId, event: FeedEvent) {
        let Some(handle) = self.handles.get_mut(&group_id) else {
            warn!(group = %group_id, "Dropping event for untracked group");
            self.group_feeds.remove(&group_id);
            return;
        };

        match event {
            FeedEvent::Initial(children) => {
                handle.replace(children);
                self.refresh_group(&group_id);
            }
            FeedEvent::Batch(changes) => {
                handle.apply(&changes);
                self.refresh_group(&group_id);
            }
            FeedEvent::Closed(e) => {
                handle.close();
                self.group_feeds.remove(&group_id);
                warn!(group = %group_id, error = %e, "Group subscription closed by store");
                self.snapshot.groups.remove(&group_id);
                self.snapshot.group_errors.insert(group_id, e.into());
            }
        }

        self.verify_and_publish();
    }

    fn refresh_group(&mut self, group_id: &GroupId) {
        let Some(handle) = self.handles.get(group_id) else {
            return;
        };

        match handle.decode(group_id) {
            Ok(Some(group)) => {
                self.snapshot.group_errors.remove(group_id);
                self.snapshot.groups.insert(group_id.clone(), group);
            }
            Ok(None) => {
                self.snapshot.groups.remove(group_id);
            }
            Err(e) => {
                warn!(group = %group_id, error = %e, "Undecodable group document");
                self.snapshot.groups.remove(group_id);
                self.snapshot.group_errors.insert(group_id.clone(), e.into());
            }
        }
    }

    /// Stop tracking but keep the last known groups for display
    fn fail(&mut self, error: MembershipError) {
        self.close_all();
        self.snapshot.status = SnapshotStatus::Failed(error);
        self.publish();
    }

    fn verify_and_publish(&mut self) {
        if self.snapshot.is_live() {
            if let Err(violation) = self.check_invariants() {
                error!(error = %violation, "Membership reconciler invariant violated");
                self.fail(violation);
                return;
            }
        }
        self.publish();
    }

    fn check_invariants(&self) -> MembershipResult<()> {
        let slots: BTreeSet<&GroupId> = self.handles.keys().collect();
        let indexed: BTreeSet<&GroupId> = self.snapshot.index.iter().collect();
        if slots != indexed {
            return Err(MembershipError::InconsistentState(format!(
                "{} slots for {} indexed groups",
                slots.len(),
                indexed.len()
            )));
        }

        if let Some(stray) = self
            .snapshot
            .groups
            .keys()
            .find(|id| !self.snapshot.index.contains(*id))
        {
            return Err(MembershipError::InconsistentState(format!(
                "group {} published but not indexed",
                stray
            )));
        }

        if let Some(orphan) = self
            .group_feeds
            .keys()
            .find(|id| !self.handles.contains_key(*id))
        {
            return Err(MembershipError::InconsistentState(format!(
                "feed for {} has no slot",
                orphan
            )));
        }

        if let Some((starved, _)) = self
            .handles
            .iter()
            .find(|(id, handle)| handle.is_live() && !self.group_feeds.contains_key(*id))
        {
            return Err(MembershipError::InconsistentState(format!(
                "live slot for {} has no feed",
                starved
            )));
        }

        Ok(())
    }

    fn publish(&mut self) {
        let count = self.handles.len();
        self.open_handles.store(count, Ordering::SeqCst);
        gauge!("membership.handles.open").set(count as f64);
        self.snapshot_tx
            .send_replace(Arc::new(self.snapshot.clone()));
    }
}

/// Index entries are presence markers; `false` and `null` mean absent
fn is_present(marker: &Value) -> bool {
    !matches!(marker, Value::Null | Value::Bool(false))
}

/// Resolves with the next index event, or never when there is no index feed.
/// A channel that ends without a `Closed` is reported as one.
async fn next_index_event(feed: &mut Option<IndexFeed>) -> FeedEvent {
    match feed {
        Some(feed) => feed.events.recv().await.unwrap_or_else(|| {
            FeedEvent::Closed(StoreError::Unavailable("index feed ended".to_string()))
        }),
        None => std::future::pending().await,
    }
}

fn group_stream(events: mpsc::UnboundedReceiver<FeedEvent>) -> GroupStream {
    let ended = FeedEvent::Closed(StoreError::Unavailable("group feed ended".to_string()));
    Box::pin(UnboundedReceiverStream::new(events).chain(tokio_stream::once(ended)))
}
