//! Auth service collaborator
//!
//! Redeems signed credentials for live sessions and publishes the current
//! session as a push-based signal. [`MemoryAuthProvider`] keeps everything in
//! process and supports the failure modes the bootstrap has to handle: revoked
//! signing keys, clock skew, refresh failure and external revocation.

use super::credential::{SessionCredential, SigningKey};
use super::errors::AuthError;
use crate::model::types::{Timestamp, UserId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A live session held by the auth service
#[derive(Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: UserId,
    pub email: String,
    pub access_token: String,
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// The remote auth service as seen by the client
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Verify a credential and open a session
    async fn redeem(&self, credential: &SessionCredential) -> Result<AuthSession, AuthError>;

    /// Ambient restore of a previously persisted session
    async fn restore(&self) -> Result<Option<AuthSession>, AuthError>;

    /// Replace the access token of the current session
    async fn refresh(&self) -> Result<AuthSession, AuthError>;

    /// Clear the session everywhere it is held
    async fn sign_out(&self) -> Result<(), AuthError>;

    /// Access token for authenticated calls to the application server
    fn access_token(&self) -> Option<String>;

    /// Push-based signal of the current session
    fn watch_session(&self) -> watch::Receiver<Option<AuthSession>>;
}

/// In-memory auth service
pub struct MemoryAuthProvider {
    trusted_keys: Mutex<HashMap<String, SigningKey>>,
    persisted: Mutex<Option<AuthSession>>,
    session_tx: watch::Sender<Option<AuthSession>>,
    max_clock_skew: Duration,
    clock_offset_millis: Mutex<i64>,
    refresh_revoked: AtomicBool,
}

impl MemoryAuthProvider {
    pub fn new(max_clock_skew: Duration) -> Self {
        let (session_tx, _) = watch::channel(None);
        Self {
            trusted_keys: Mutex::new(HashMap::new()),
            persisted: Mutex::new(None),
            session_tx,
            max_clock_skew,
            clock_offset_millis: Mutex::new(0),
            refresh_revoked: AtomicBool::new(false),
        }
    }

    /// Accept credentials signed with `key`
    pub fn trust_key(&self, key: SigningKey) {
        lock(&self.trusted_keys).insert(key.id().to_string(), key);
    }

    /// Stop accepting credentials signed with `key_id`
    pub fn revoke_signing_key(&self, key_id: &str) {
        lock(&self.trusted_keys).remove(key_id);
    }

    /// Seed a persisted session, as if left over from a previous run
    pub fn persist_session(&self, session: AuthSession) {
        *lock(&self.persisted) = Some(session);
    }

    /// Shift the service's clock relative to the local one
    pub fn set_clock_offset(&self, offset_millis: i64) {
        *lock(&self.clock_offset_millis) = offset_millis;
    }

    /// Make the next refreshes fail
    pub fn revoke_refresh(&self) {
        self.refresh_revoked.store(true, Ordering::SeqCst);
    }

    /// Server-side revocation of the current session
    pub fn revoke_session(&self) {
        *lock(&self.persisted) = None;
        self.session_tx.send_replace(None);
        info!("Session revoked externally");
    }

    fn now(&self) -> Timestamp {
        let offset = *lock(&self.clock_offset_millis);
        let now = Timestamp::now().as_millis() as i64;
        Timestamp::from_millis(now.saturating_add(offset).max(0) as u64)
    }

    fn open(&self, user_id: UserId, email: String) -> AuthSession {
        let session = AuthSession {
            user_id,
            email,
            access_token: uuid::Uuid::new_v4().to_string(),
        };
        *lock(&self.persisted) = Some(session.clone());
        self.session_tx.send_replace(Some(session.clone()));
        session
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl AuthProvider for MemoryAuthProvider {
    async fn redeem(&self, credential: &SessionCredential) -> Result<AuthSession, AuthError> {
        let key = lock(&self.trusted_keys)
            .get(&credential.key_id)
            .cloned()
            .ok_or_else(|| AuthError::Rejected("unknown or revoked signing key".to_string()))?;

        if !credential.verify(&key) {
            warn!(user = %credential.user_id, "Credential signature mismatch");
            return Err(AuthError::Rejected("invalid signature".to_string()));
        }

        let now = self.now();
        let skew = self.max_clock_skew.as_millis() as u64;
        if now > credential.expires_at.plus_millis(skew) {
            return Err(AuthError::Rejected("credential expired".to_string()));
        }
        if credential.issued_at > now.plus_millis(skew) {
            return Err(AuthError::Rejected("credential issued in the future".to_string()));
        }

        debug!(user = %credential.user_id, "Credential redeemed");
        Ok(self.open(credential.user_id.clone(), credential.email.clone()))
    }

    async fn restore(&self) -> Result<Option<AuthSession>, AuthError> {
        let persisted = lock(&self.persisted).clone();
        if persisted.is_some() {
            self.session_tx.send_replace(persisted.clone());
        }
        Ok(persisted)
    }

    async fn refresh(&self) -> Result<AuthSession, AuthError> {
        let current = lock(&self.persisted).clone().ok_or(AuthError::NoSession)?;

        if self.refresh_revoked.load(Ordering::SeqCst) {
            *lock(&self.persisted) = None;
            self.session_tx.send_replace(None);
            return Err(AuthError::Rejected("refresh token revoked".to_string()));
        }

        Ok(self.open(current.user_id, current.email))
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        *lock(&self.persisted) = None;
        self.session_tx.send_replace(None);
        Ok(())
    }

    fn access_token(&self) -> Option<String> {
        self.session_tx
            .borrow()
            .as_ref()
            .map(|session| session.access_token.clone())
    }

    fn watch_session(&self) -> watch::Receiver<Option<AuthSession>> {
        self.session_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_with_key() -> (MemoryAuthProvider, SigningKey) {
        let key = SigningKey::generate();
        let provider = MemoryAuthProvider::new(Duration::from_secs(30));
        provider.trust_key(key.clone());
        (provider, key)
    }

    fn credential(key: &SigningKey, ttl_millis: u64) -> SessionCredential {
        SessionCredential::issue(key, UserId::new("u1"), "a@example.com".to_string(), ttl_millis)
    }

    #[tokio::test]
    async fn test_redeem_opens_session() {
        let (provider, key) = provider_with_key();
        let mut rx = provider.watch_session();

        let session = provider.redeem(&credential(&key, 60_000)).await.unwrap();
        assert_eq!(session.user_id, UserId::new("u1"));
        assert_eq!(provider.access_token(), Some(session.access_token.clone()));

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref(), Some(&session));
    }

    #[tokio::test]
    async fn test_revoked_key_rejected() {
        let (provider, key) = provider_with_key();
        provider.revoke_signing_key(key.id());

        let result = provider.redeem(&credential(&key, 60_000)).await;
        assert!(matches!(result, Err(AuthError::Rejected(_))));
        assert_eq!(provider.access_token(), None);
    }

    #[tokio::test]
    async fn test_clock_skew_beyond_allowance_rejected() {
        let (provider, key) = provider_with_key();
        provider.set_clock_offset(120_000);

        let result = provider.redeem(&credential(&key, 60_000)).await;
        assert_eq!(result, Err(AuthError::Rejected("credential expired".to_string())));
    }

    #[tokio::test]
    async fn test_clock_skew_within_allowance_accepted() {
        let (provider, key) = provider_with_key();
        provider.set_clock_offset(-10_000);
        assert!(provider.redeem(&credential(&key, 60_000)).await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_replaces_token() {
        let (provider, key) = provider_with_key();
        let first = provider.redeem(&credential(&key, 60_000)).await.unwrap();
        let refreshed = provider.refresh().await.unwrap();

        assert_eq!(first.user_id, refreshed.user_id);
        assert_ne!(first.access_token, refreshed.access_token);
    }

    #[tokio::test]
    async fn test_failed_refresh_clears_session() {
        let (provider, key) = provider_with_key();
        provider.redeem(&credential(&key, 60_000)).await.unwrap();
        provider.revoke_refresh();

        assert!(matches!(provider.refresh().await, Err(AuthError::Rejected(_))));
        assert_eq!(provider.access_token(), None);
        assert_eq!(provider.restore().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_restore_returns_persisted_session() {
        let provider = MemoryAuthProvider::new(Duration::from_secs(30));
        assert_eq!(provider.restore().await.unwrap(), None);

        let session = AuthSession {
            user_id: UserId::new("u1"),
            email: "a@example.com".to_string(),
            access_token: "t".to_string(),
        };
        provider.persist_session(session.clone());
        assert_eq!(provider.restore().await.unwrap(), Some(session));
    }
}
