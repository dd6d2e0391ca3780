//! Test fixtures
//!
//! [`TestWorld`] wires one shared in-memory store and application server to
//! any number of signed-in users, each with their own reconciler.

use crate::client::{InMemoryBackend, JournalClient};
use crate::config::{Config, MembershipConfig};
use crate::membership::{MembershipReconciler, Snapshot};
use crate::model::types::{GroupId, UserId};
use crate::model::{Group, Identity};
use crate::remote::{path, MemoryStore, RemoteStore, StorePath, Transaction};
use crate::session::{MagicCodeServer, MemoryAuthProvider, SessionBootstrap, SigningKey};
use crate::test_utils::async_helpers::wait_for_snapshot;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Shared collaborators for multi-user scenarios
pub struct TestWorld {
    pub store: MemoryStore,
    pub server: Arc<MagicCodeServer>,
    pub config: Config,
}

/// A signed-in user with a started reconciler
pub struct TestMember {
    pub identity: Identity,
    pub reconciler: MembershipReconciler,
}

impl TestMember {
    pub fn id(&self) -> &UserId {
        &self.identity.id
    }

    /// Wait until the published snapshot satisfies `predicate`
    pub async fn wait_for(&self, predicate: impl FnMut(&Snapshot) -> bool) -> Arc<Snapshot> {
        let mut watch = self.reconciler.subscribe_snapshot();
        wait_for_snapshot(&mut watch, predicate).await
    }
}

impl TestWorld {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let server = Arc::new(MagicCodeServer::new(
            SigningKey::generate(),
            config.session.code_ttl,
            config.session.credential_ttl,
        ));
        Self {
            store: MemoryStore::new(),
            server,
            config,
        }
    }

    /// An auth service that trusts this world's application server
    pub fn auth_provider(&self) -> Arc<MemoryAuthProvider> {
        let auth = Arc::new(MemoryAuthProvider::new(self.config.session.max_clock_skew));
        auth.trust_key(self.server.signing_key().clone());
        auth
    }

    pub fn bootstrap(&self) -> (SessionBootstrap, Arc<MemoryAuthProvider>) {
        let auth = self.auth_provider();
        (SessionBootstrap::new(self.server.clone(), auth.clone()), auth)
    }

    /// Full client over this world's collaborators
    pub fn client(&self) -> (JournalClient, InMemoryBackend) {
        let backend = InMemoryBackend {
            store: self.store.clone(),
            server: self.server.clone(),
            auth: self.auth_provider(),
        };
        (JournalClient::with_backend(&backend, &self.config), backend)
    }

    pub fn reconciler(&self) -> MembershipReconciler {
        self.reconciler_with(self.config.membership.clone())
    }

    pub fn reconciler_with(&self, config: MembershipConfig) -> MembershipReconciler {
        let store: Arc<dyn RemoteStore> = Arc::new(self.store.clone());
        MembershipReconciler::new(store, self.server.clone(), config)
    }

    /// Sign in through the magic-code flow and return the identity
    pub async fn sign_in(&self, email: &str) -> Identity {
        let (bootstrap, _auth) = self.bootstrap();
        bootstrap.request_code(email).await.expect("request code");
        let code = self.server.last_code_for(email).expect("code was issued");
        bootstrap.exchange_code(&code).await.expect("exchange code")
    }

    /// Sign in and start a reconciler, waiting for the index to go live
    pub async fn member(&self, email: &str) -> TestMember {
        let identity = self.sign_in(email).await;
        let reconciler = self.reconciler();
        reconciler
            .start(identity.clone())
            .await
            .expect("start reconciler");

        let member = TestMember {
            identity,
            reconciler,
        };
        member.wait_for(|s| s.is_live()).await;
        member
    }

    /// Write a group with the given members and their index entries in one transaction
    pub async fn seed_group(&self, name: &str, members: &[&Identity]) -> GroupId {
        let group_id = GroupId::generate();
        let (first, rest) = members.split_first().expect("at least one member");
        let mut group = Group::new(group_id.clone(), name.to_string(), &first.id, &first.email);
        for member in rest {
            group.members.insert(
                member.id.clone(),
                crate::model::Member {
                    email: member.email.clone(),
                },
            );
        }

        let mut transaction = Transaction::new().set(
            path::group(&group_id).expect("group path"),
            serde_json::to_value(&group).expect("group document"),
        );
        for member in members {
            transaction = transaction.set(
                path::user_group_entry(&member.id, &group_id).expect("index path"),
                Value::Bool(true),
            );
        }
        self.store.transact(transaction).await.expect("seed group");
        group_id
    }

    pub fn index_entry(&self, user: &UserId, group: &GroupId) -> Option<Value> {
        self.store
            .get(&path::user_group_entry(user, group).expect("index path"))
    }

    pub fn group_document(&self, group: &GroupId) -> Option<Value> {
        self.store.get(&path::group(group).expect("group path"))
    }

    pub fn index_path(&self, user: &UserId) -> StorePath {
        path::user_groups(user).expect("index path")
    }
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// A membership config with short timeouts for failure-path tests
pub fn quick_membership_config() -> MembershipConfig {
    MembershipConfig {
        operation_timeout: Duration::from_millis(500),
        invite_delivery_timeout: Duration::from_millis(500),
    }
}
