//! Client facade
//!
//! [`JournalClient`] owns the session bootstrap and the membership
//! reconciler, and keeps the reconciler pointed at the current identity:
//! every identity change tears the reconciler down and, when someone is
//! signed in, starts it again for the new identity.

use crate::config::{Config, ConfigError};
use crate::membership::{
    MembershipError, MembershipReconciler, MembershipResult, Snapshot, SnapshotStatus,
    SnapshotWatch,
};
use crate::model::types::{GroupId, InvitationId, UserId};
use crate::model::{AuthState, Identity};
use crate::remote::{MemoryStore, RemoteStore};
use crate::session::{
    AppServer, AuthProvider, IdentityWatch, MagicCodeServer, MemoryAuthProvider,
    SessionBootstrap, SessionResult, SigningKey,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// In-process collaborators for demos and tests
#[derive(Clone)]
pub struct InMemoryBackend {
    pub store: MemoryStore,
    pub server: Arc<MagicCodeServer>,
    pub auth: Arc<MemoryAuthProvider>,
}

impl InMemoryBackend {
    /// Build collaborators from `config`, seeding the store if a seed file is set
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let store = match &config.store.seed_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
                let root: Value = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
                MemoryStore::from_json(root).map_err(|e| ConfigError::Seed(e.to_string()))?
            }
            None => MemoryStore::new(),
        };

        let server = Arc::new(MagicCodeServer::new(
            SigningKey::generate(),
            config.session.code_ttl,
            config.session.credential_ttl,
        ));
        let auth = Arc::new(MemoryAuthProvider::new(config.session.max_clock_skew));
        auth.trust_key(server.signing_key().clone());

        Ok(Self {
            store,
            server,
            auth,
        })
    }
}

/// Consumer-facing entry point
pub struct JournalClient {
    session: Arc<SessionBootstrap>,
    membership: Arc<MembershipReconciler>,
    ready_timeout: Duration,
    driver: JoinHandle<()>,
}

impl JournalClient {
    /// Wire the client over arbitrary collaborators. Must be called inside a tokio runtime.
    pub fn new(
        app: Arc<dyn AppServer>,
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn RemoteStore>,
        config: &Config,
    ) -> Self {
        let session = Arc::new(SessionBootstrap::new(app.clone(), auth));
        let membership = Arc::new(MembershipReconciler::new(
            store,
            app,
            config.membership.clone(),
        ));
        let driver = tokio::spawn(drive_membership(
            session.subscribe_identity(),
            membership.clone(),
        ));

        Self {
            session,
            membership,
            ready_timeout: config.membership.operation_timeout,
            driver,
        }
    }

    pub fn with_backend(backend: &InMemoryBackend, config: &Config) -> Self {
        Self::new(
            backend.server.clone(),
            backend.auth.clone(),
            Arc::new(backend.store.clone()),
            config,
        )
    }

    pub fn session(&self) -> &SessionBootstrap {
        &self.session
    }

    pub fn membership(&self) -> &MembershipReconciler {
        &self.membership
    }

    pub fn subscribe_identity(&self) -> IdentityWatch {
        self.session.subscribe_identity()
    }

    pub fn subscribe_snapshot(&self) -> SnapshotWatch {
        self.membership.subscribe_snapshot()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.membership.snapshot()
    }

    pub async fn restore(&self) -> SessionResult<AuthState> {
        self.session.restore().await
    }

    pub async fn request_code(&self, email: &str) -> SessionResult<()> {
        self.session.request_code(email).await
    }

    pub async fn exchange_code(&self, code: &str) -> SessionResult<Identity> {
        self.session.exchange_code(code).await
    }

    pub async fn refresh(&self) -> SessionResult<Identity> {
        self.session.refresh().await
    }

    pub async fn sign_out(&self) {
        self.session.sign_out().await
    }

    /// Wait until the reconciler tracks the signed-in user and the index
    /// has answered. `NotStarted` when nobody is signed in, `Network` when
    /// the index does not answer in time.
    pub async fn ready(&self) -> MembershipResult<Arc<Snapshot>> {
        let identity = self
            .session
            .current()
            .identity()
            .cloned()
            .ok_or(MembershipError::NotStarted)?;

        let mut watch = self.membership.subscribe_snapshot();
        let caught_up = watch.wait_for(|snapshot| {
            snapshot.user.as_ref() == Some(&identity.id)
                && snapshot.status != SnapshotStatus::Loading
        });
        match tokio::time::timeout(self.ready_timeout, caught_up).await {
            Ok(result) => result,
            Err(_) => Err(MembershipError::Network(format!(
                "membership index did not answer within {:?}",
                self.ready_timeout
            ))),
        }
    }

    pub async fn create_group(&self, name: &str) -> MembershipResult<GroupId> {
        self.ready().await?;
        self.membership.create_group(name).await
    }

    pub async fn delete_group(&self, group_id: &GroupId) -> MembershipResult<()> {
        self.ready().await?;
        self.membership.delete_group(group_id).await
    }

    pub async fn remove_member(&self, group_id: &GroupId, user_id: &UserId) -> MembershipResult<()> {
        self.ready().await?;
        self.membership.remove_member(group_id, user_id).await
    }

    pub async fn invite_member(
        &self,
        group_id: &GroupId,
        email: &str,
    ) -> MembershipResult<InvitationId> {
        self.ready().await?;
        self.membership.invite_member(group_id, email).await
    }

    /// Stop following the identity and close every subscription
    pub async fn shutdown(self) {
        self.driver.abort();
        self.membership.stop().await;
        info!("Journal client shut down");
    }
}

impl Drop for JournalClient {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn drive_membership(mut identity: IdentityWatch, membership: Arc<MembershipReconciler>) {
    let Ok(mut state) = identity.resolved().await else {
        return;
    };

    loop {
        membership.stop().await;
        if let AuthState::Authenticated(current) = &state {
            debug!(user = %current.id, "Identity changed, restarting membership");
            if let Err(e) = membership.start(current.clone()).await {
                warn!(error = %e, "Could not start membership reconciliation");
            }
        }

        state = match identity.changed().await {
            Ok(next) => next,
            Err(_) => break,
        };
    }

    membership.stop().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Feed, FeedEvent, FeedRegistration, StorePath, StoreResult, Transaction};
    use crate::session::AuthSession;
    use crate::test_utils::{quick_membership_config, wait_for_snapshot, TestWorld};
    use tempfile::TempDir;

    async fn sign_in(client: &JournalClient, backend: &InMemoryBackend, email: &str) -> Identity {
        client.request_code(email).await.unwrap();
        let code = backend.server.last_code_for(email).unwrap();
        client.exchange_code(&code).await.unwrap()
    }

    #[tokio::test]
    async fn test_sign_in_starts_membership() {
        let world = TestWorld::new();
        let (client, backend) = world.client();
        let identity = sign_in(&client, &backend, "alice@example.com").await;

        let snapshot = client.ready().await.unwrap();
        assert_eq!(snapshot.user.as_ref(), Some(&identity.id));
        assert!(snapshot.is_live());
        assert!(snapshot.groups.is_empty());
    }

    #[tokio::test]
    async fn test_operations_require_sign_in() {
        let world = TestWorld::new();
        let (client, _backend) = world.client();
        client.restore().await.unwrap();

        assert_eq!(
            client.create_group("Family").await,
            Err(MembershipError::NotStarted)
        );
    }

    /// Accepts subscriptions but never delivers anything on them
    #[derive(Default)]
    struct SilentStore {
        senders: std::sync::Mutex<Vec<tokio::sync::mpsc::UnboundedSender<FeedEvent>>>,
    }

    #[async_trait::async_trait]
    impl RemoteStore for SilentStore {
        async fn read(&self, _path: &StorePath) -> StoreResult<Option<Value>> {
            Ok(None)
        }

        fn subscribe(&self, path: &StorePath) -> StoreResult<Feed> {
            let (tx, events) = tokio::sync::mpsc::unbounded_channel();
            self.senders.lock().unwrap().push(tx);
            Ok(Feed {
                events,
                registration: FeedRegistration::new(0, path.clone(), || {}),
            })
        }

        async fn transact(&self, _transaction: Transaction) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unanswered_index_is_a_network_error() {
        let world = TestWorld::new();
        let mut config = world.config.clone();
        config.membership = quick_membership_config();
        let client = JournalClient::new(
            world.server.clone(),
            world.auth_provider(),
            Arc::new(SilentStore::default()),
            &config,
        );

        client.request_code("alice@example.com").await.unwrap();
        let code = world.server.last_code_for("alice@example.com").unwrap();
        client.exchange_code(&code).await.unwrap();

        let result = client.ready().await;
        assert!(matches!(result, Err(MembershipError::Network(_))));
        assert_eq!(client.snapshot().status, SnapshotStatus::Loading);
    }

    #[tokio::test]
    async fn test_create_group_through_client() {
        let world = TestWorld::new();
        let (client, backend) = world.client();
        let identity = sign_in(&client, &backend, "alice@example.com").await;

        let group_id = client.create_group("Family").await.unwrap();

        let mut watch = client.subscribe_snapshot();
        let snapshot = wait_for_snapshot(&mut watch, |s| s.groups.contains_key(&group_id)).await;
        assert!(snapshot.groups[&group_id].is_member(&identity.id));
    }

    #[tokio::test]
    async fn test_sign_out_tears_down_membership() {
        let world = TestWorld::new();
        let (client, backend) = world.client();
        sign_in(&client, &backend, "alice@example.com").await;
        client.create_group("Family").await.unwrap();

        let mut watch = client.subscribe_snapshot();
        wait_for_snapshot(&mut watch, |s| s.groups.len() == 1).await;

        client.sign_out().await;
        let snapshot = wait_for_snapshot(&mut watch, |s| s.status == SnapshotStatus::Idle).await;
        assert!(snapshot.groups.is_empty());
        assert_eq!(snapshot.user, None);
        assert_eq!(backend.store.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_switching_users_rebuilds_from_scratch() {
        let world = TestWorld::new();
        let (client, backend) = world.client();

        sign_in(&client, &backend, "alice@example.com").await;
        let alice_group = client.create_group("Alice only").await.unwrap();
        let mut watch = client.subscribe_snapshot();
        wait_for_snapshot(&mut watch, |s| s.groups.contains_key(&alice_group)).await;

        client.sign_out().await;
        let bob = sign_in(&client, &backend, "bob@example.com").await;

        let snapshot = wait_for_snapshot(&mut watch, |s| {
            s.user.as_ref() == Some(&bob.id) && s.is_live()
        })
        .await;
        assert!(!snapshot.index.contains(&alice_group));
        assert!(snapshot.groups.is_empty());
    }

    #[tokio::test]
    async fn test_ambient_restore_starts_membership() {
        let world = TestWorld::new();
        let alice = world.sign_in("alice@example.com").await;
        let group_id = world.seed_group("Family", &[&alice]).await;

        let (client, backend) = world.client();
        backend.auth.persist_session(AuthSession {
            user_id: alice.id.clone(),
            email: alice.email.clone(),
            access_token: "persisted".to_string(),
        });
        client.restore().await.unwrap();

        let mut watch = client.subscribe_snapshot();
        let snapshot = wait_for_snapshot(&mut watch, |s| s.groups.contains_key(&group_id)).await;
        assert_eq!(snapshot.groups[&group_id].name, "Family");
    }

    #[tokio::test]
    async fn test_backend_from_seed_file() {
        let dir = TempDir::new().unwrap();
        let seed = dir.path().join("seed.json");
        std::fs::write(
            &seed,
            r#"{ "groups": { "g1": { "name": "Seeded", "members": { "u1": { "email": "a@example.com" } } } } }"#,
        )
        .unwrap();

        let mut config = Config::default();
        config.store.seed_file = Some(seed);
        let backend = InMemoryBackend::from_config(&config).unwrap();

        assert_eq!(
            backend.store.get(&crate::remote::path::group(&GroupId::new("g1")).unwrap()).unwrap()["name"],
            "Seeded"
        );
    }

    #[test]
    fn test_missing_seed_file_is_reported() {
        let mut config = Config::default();
        config.store.seed_file = Some("/nonexistent/seed.json".into());
        assert!(matches!(
            InMemoryBackend::from_config(&config),
            Err(ConfigError::Read { .. })
        ));
    }
}
