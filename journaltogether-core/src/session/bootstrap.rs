//! Passwordless session bootstrap
//!
//! Turns a single-use magic code into a durable session and publishes the
//! resulting identity as a live signal.
//!
//! ```text
//! Unknown ──restore──▶ Unauthenticated ──exchange_code──▶ Authenticated(Identity)
//!    │                        ▲                                   │
//!    └──restore (persisted)───┼──────────────▶ Authenticated ─────┤
//!                             └─── sign_out / refresh failure / revocation
//! ```

use super::app_server::AppServer;
use super::auth::{AuthProvider, AuthSession};
use super::errors::{AppServerError, AuthError, SessionError, SessionResult};
use crate::model::validation::validate_email;
use crate::model::{AuthState, Identity};
use metrics::counter;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn identity_from(session: &AuthSession) -> Identity {
    Identity::new(
        session.user_id.clone(),
        session.email.clone(),
        session.access_token.clone(),
    )
}

/// Publish `next` unless it equals the current state
fn publish(state: &watch::Sender<AuthState>, next: AuthState) -> bool {
    state.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    })
}

/// Receiver side of the identity signal
///
/// Holds the current value from the moment it is created. Dropping it unsubscribes.
#[derive(Debug, Clone)]
pub struct IdentityWatch {
    rx: watch::Receiver<AuthState>,
}

impl IdentityWatch {
    /// Current state, marking it as seen
    pub fn current(&mut self) -> AuthState {
        self.rx.borrow_and_update().clone()
    }

    /// Wait for the next change
    pub async fn changed(&mut self) -> SessionResult<AuthState> {
        self.rx.changed().await.map_err(|_| SessionError::SignalClosed)?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Wait until the state is no longer [`AuthState::Unknown`]
    pub async fn resolved(&mut self) -> SessionResult<AuthState> {
        let state = self
            .rx
            .wait_for(AuthState::is_resolved)
            .await
            .map_err(|_| SessionError::SignalClosed)?;
        Ok(state.clone())
    }

    pub fn into_inner(self) -> watch::Receiver<AuthState> {
        self.rx
    }
}

/// Exchanges magic codes for sessions and owns the identity signal
pub struct SessionBootstrap {
    app: Arc<dyn AppServer>,
    auth: Arc<dyn AuthProvider>,
    state: Arc<watch::Sender<AuthState>>,
    follower: JoinHandle<()>,
}

impl SessionBootstrap {
    /// Create the bootstrap in the `Unknown` state and start following the
    /// auth service's session signal. Must be called inside a tokio runtime.
    pub fn new(app: Arc<dyn AppServer>, auth: Arc<dyn AuthProvider>) -> Self {
        let (state_tx, _) = watch::channel(AuthState::Unknown);
        let state = Arc::new(state_tx);
        let follower = tokio::spawn(follow_auth_session(auth.watch_session(), state.clone()));

        Self {
            app,
            auth,
            state,
            follower,
        }
    }

    /// Subscribe to the identity signal
    pub fn subscribe_identity(&self) -> IdentityWatch {
        IdentityWatch {
            rx: self.state.subscribe(),
        }
    }

    /// Current state without subscribing
    pub fn current(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// Ambient restore. Resolves `Unknown` once; afterwards returns the current state.
    pub async fn restore(&self) -> SessionResult<AuthState> {
        if self.state.borrow().is_resolved() {
            return Ok(self.current());
        }

        let restored = self.auth.restore().await.map_err(|e| match e {
            AuthError::Unavailable(msg) => SessionError::Network(msg),
            other => SessionError::SessionRedemptionFailed(other.to_string()),
        });

        let next = match &restored {
            Ok(Some(session)) => AuthState::Authenticated(identity_from(session)),
            Ok(None) | Err(_) => AuthState::Unauthenticated,
        };

        // A sign-in that raced ahead of the restore wins.
        self.state.send_if_modified(|current| {
            if current.is_resolved() {
                false
            } else {
                *current = next;
                true
            }
        });
        info!(authenticated = self.current().identity().is_some(), "Session state resolved");

        restored.map(|_| self.current())
    }

    /// Ask the application server to send a magic code to `email`
    pub async fn request_code(&self, email: &str) -> SessionResult<()> {
        let email = validate_email(email)?;
        self.app.request_code(&email).await.map_err(|e| match e {
            AppServerError::Unavailable(msg) => SessionError::Network(msg),
            AppServerError::Rejected(msg) => SessionError::RequestRejected(msg),
            AppServerError::Unauthorized => SessionError::RequestRejected(e.to_string()),
        })?;
        debug!(email = %email, "Magic code requested");
        Ok(())
    }

    /// Exchange a magic code for a session and publish the new identity
    pub async fn exchange_code(&self, code: &str) -> SessionResult<Identity> {
        let result = self.redeem_code(code.trim()).await;
        match &result {
            Ok(identity) => {
                counter!("session.exchange.success").increment(1);
                publish(&self.state, AuthState::Authenticated(identity.clone()));
                info!(user = %identity.id, "Signed in with magic code");
            }
            Err(e) => {
                counter!("session.exchange.failed").increment(1);
                warn!(error = %e, "Code exchange failed");
            }
        }
        result
    }

    async fn redeem_code(&self, code: &str) -> SessionResult<Identity> {
        let credential = self.app.exchange_code(code).await.map_err(|e| match e {
            AppServerError::Unavailable(msg) => SessionError::Network(msg),
            AppServerError::Rejected(msg) => SessionError::InvalidCode(msg),
            AppServerError::Unauthorized => SessionError::InvalidCode(e.to_string()),
        })?;

        let session = self.auth.redeem(&credential).await.map_err(|e| match e {
            AuthError::Unavailable(msg) => SessionError::Network(msg),
            other => SessionError::SessionRedemptionFailed(other.to_string()),
        })?;

        Ok(identity_from(&session))
    }

    /// Refresh the access token. Failure signs the user out.
    pub async fn refresh(&self) -> SessionResult<Identity> {
        if self.current().identity().is_none() {
            return Err(SessionError::NotAuthenticated);
        }

        match self.auth.refresh().await {
            Ok(session) => {
                let identity = identity_from(&session);
                publish(&self.state, AuthState::Authenticated(identity.clone()));
                Ok(identity)
            }
            Err(AuthError::Unavailable(msg)) => Err(SessionError::Network(msg)),
            Err(e) => {
                warn!(error = %e, "Token refresh failed, signing out");
                publish(&self.state, AuthState::Unauthenticated);
                Err(SessionError::SessionRedemptionFailed(e.to_string()))
            }
        }
    }

    /// Access token for authenticated application-server calls
    pub fn access_token(&self) -> SessionResult<String> {
        self.auth.access_token().ok_or(SessionError::NotAuthenticated)
    }

    /// Clear the session and deliver `Unauthenticated` to every subscriber
    pub async fn sign_out(&self) {
        if let Err(e) = self.auth.sign_out().await {
            warn!(error = %e, "Auth service sign-out failed; clearing local session anyway");
        }
        publish(&self.state, AuthState::Unauthenticated);
        info!("Signed out");
    }
}

impl Drop for SessionBootstrap {
    fn drop(&mut self) {
        self.follower.abort();
    }
}

/// Mirror sign-ins, token refreshes and revocations made behind our back
async fn follow_auth_session(
    mut sessions: watch::Receiver<Option<AuthSession>>,
    state: Arc<watch::Sender<AuthState>>,
) {
    while sessions.changed().await.is_ok() {
        let session = sessions.borrow_and_update().clone();
        match session {
            Some(session) => {
                publish(&state, AuthState::Authenticated(identity_from(&session)));
            }
            None => {
                let was_signed_in = state.borrow().identity().is_some();
                if was_signed_in && publish(&state, AuthState::Unauthenticated) {
                    info!("Session ended by the auth service");
                }
            }
        }
    }
    debug!("Auth session signal closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::app_server::MagicCodeServer;
    use crate::session::auth::MemoryAuthProvider;
    use crate::session::credential::SigningKey;
    use crate::test_utils::assert_completes_within;
    use std::time::Duration;

    struct Harness {
        server: Arc<MagicCodeServer>,
        auth: Arc<MemoryAuthProvider>,
        bootstrap: SessionBootstrap,
    }

    fn harness() -> Harness {
        let key = SigningKey::generate();
        let auth = Arc::new(MemoryAuthProvider::new(Duration::from_secs(30)));
        auth.trust_key(key.clone());
        let server = Arc::new(MagicCodeServer::new(
            key,
            Duration::from_secs(600),
            Duration::from_secs(300),
        ));
        let bootstrap = SessionBootstrap::new(server.clone(), auth.clone());
        Harness {
            server,
            auth,
            bootstrap,
        }
    }

    async fn sign_in(h: &Harness, email: &str) -> Identity {
        h.bootstrap.request_code(email).await.unwrap();
        let code = h.server.last_code_for(email).unwrap();
        h.bootstrap.exchange_code(&code).await.unwrap()
    }

    #[tokio::test]
    async fn test_initial_state_is_unknown_until_restore() {
        let h = harness();
        let mut watch = h.bootstrap.subscribe_identity();
        assert_eq!(watch.current(), AuthState::Unknown);

        let state = h.bootstrap.restore().await.unwrap();
        assert_eq!(state, AuthState::Unauthenticated);
        assert_eq!(watch.resolved().await.unwrap(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_restore_resolves_only_once() {
        let h = harness();
        h.bootstrap.restore().await.unwrap();

        h.auth.persist_session(AuthSession {
            user_id: crate::model::UserId::new("u1"),
            email: "a@example.com".to_string(),
            access_token: "t".to_string(),
        });
        assert_eq!(h.bootstrap.restore().await.unwrap(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_ambient_restore_authenticates() {
        let h = harness();
        h.auth.persist_session(AuthSession {
            user_id: crate::model::UserId::new("u1"),
            email: "a@example.com".to_string(),
            access_token: "t".to_string(),
        });

        let state = h.bootstrap.restore().await.unwrap();
        assert_eq!(state.identity().map(|i| i.email.as_str()), Some("a@example.com"));
    }

    #[tokio::test]
    async fn test_invalid_email_rejected_before_network() {
        let h = harness();
        let result = h.bootstrap.request_code("not-an-email").await;
        assert!(matches!(result, Err(SessionError::Validation(_))));
        assert!(h.server.outbox().is_empty());
    }

    #[tokio::test]
    async fn test_request_code_network_failure_is_transient() {
        let h = harness();
        h.server.set_online(false);
        let err = h.bootstrap.request_code("a@example.com").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_exchange_publishes_identity() {
        let h = harness();
        let mut watch = h.bootstrap.subscribe_identity();

        let identity = sign_in(&h, "alice@example.com").await;
        assert_eq!(identity.email, "alice@example.com");
        assert_eq!(watch.resolved().await.unwrap(), AuthState::Authenticated(identity));
    }

    #[tokio::test]
    async fn test_second_exchange_of_same_code_fails() {
        let h = harness();
        h.bootstrap.request_code("alice@example.com").await.unwrap();
        let code = h.server.last_code_for("alice@example.com").unwrap();

        assert!(h.bootstrap.exchange_code(&code).await.is_ok());
        let second = h.bootstrap.exchange_code(&code).await;
        assert!(matches!(second, Err(SessionError::InvalidCode(_))));
    }

    #[tokio::test]
    async fn test_revoked_signing_key_fails_redemption() {
        let h = harness();
        h.auth.revoke_signing_key(h.server.signing_key().id());
        h.bootstrap.request_code("alice@example.com").await.unwrap();
        let code = h.server.last_code_for("alice@example.com").unwrap();

        let result = h.bootstrap.exchange_code(&code).await;
        assert!(matches!(result, Err(SessionError::SessionRedemptionFailed(_))));
        assert_eq!(h.bootstrap.current().identity(), None);
    }

    #[tokio::test]
    async fn test_sign_out_delivers_unauthenticated() {
        let h = harness();
        sign_in(&h, "alice@example.com").await;
        let mut watch = h.bootstrap.subscribe_identity();
        assert!(watch.current().identity().is_some());

        h.bootstrap.sign_out().await;
        assert_eq!(watch.changed().await.unwrap(), AuthState::Unauthenticated);
        assert!(matches!(h.bootstrap.access_token(), Err(SessionError::NotAuthenticated)));
    }

    #[tokio::test]
    async fn test_refresh_replaces_identity_wholesale() {
        let h = harness();
        let before = sign_in(&h, "alice@example.com").await;
        let after = h.bootstrap.refresh().await.unwrap();

        assert_eq!(before.id, after.id);
        assert_ne!(before.session_token, after.session_token);
        assert_eq!(h.bootstrap.current(), AuthState::Authenticated(after));
    }

    #[tokio::test]
    async fn test_refresh_failure_signs_out() {
        let h = harness();
        sign_in(&h, "alice@example.com").await;
        h.auth.revoke_refresh();

        assert!(h.bootstrap.refresh().await.is_err());
        assert_eq!(h.bootstrap.current(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_external_revocation_signs_out() {
        let h = harness();
        sign_in(&h, "alice@example.com").await;
        let mut watch = h.bootstrap.subscribe_identity();
        watch.current();

        h.auth.revoke_session();
        let state = assert_completes_within(Duration::from_secs(1), watch.changed()).await;
        assert_eq!(state.unwrap(), AuthState::Unauthenticated);
    }
}
