//! Application server collaborator
//!
//! The application server issues magic codes, exchanges them for signed
//! session credentials, and delivers invitations. [`MagicCodeServer`] is the
//! in-memory implementation; out-of-band delivery is recorded in an outbox
//! instead of being sent.

use super::credential::{SessionCredential, SigningKey};
use super::errors::AppServerError;
use crate::model::types::{Timestamp, UserId};
use crate::model::validation::{validate_code, validate_email};
use crate::model::Invitation;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// The application server as seen by the client
#[async_trait]
pub trait AppServer: Send + Sync {
    /// Generate a one-time code for `email` and deliver it out of band
    async fn request_code(&self, email: &str) -> Result<(), AppServerError>;

    /// Validate a code (format, expiry, single use) and return a signed credential
    async fn exchange_code(&self, code: &str) -> Result<SessionCredential, AppServerError>;

    /// Deliver an already-recorded invitation
    async fn deliver_invitation(
        &self,
        access_token: &str,
        invitation: &Invitation,
    ) -> Result<(), AppServerError>;
}

/// A code or invitation handed to the out-of-band channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    MagicCode { email: String, code: String },
    Invitation(Invitation),
}

#[derive(Debug)]
struct PendingCode {
    email: String,
    expires_at: Timestamp,
}

#[derive(Default)]
struct ServerState {
    pending: HashMap<String, PendingCode>,
    users: HashMap<String, UserId>,
    outbox: Vec<OutboundMessage>,
}

/// In-memory application server
pub struct MagicCodeServer {
    state: Mutex<ServerState>,
    signing_key: SigningKey,
    code_ttl: Duration,
    credential_ttl: Duration,
    online: AtomicBool,
}

impl MagicCodeServer {
    pub fn new(signing_key: SigningKey, code_ttl: Duration, credential_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            signing_key,
            code_ttl,
            credential_ttl,
            online: AtomicBool::new(true),
        }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Most recent code delivered to `email`, as the user would read it
    pub fn last_code_for(&self, email: &str) -> Option<String> {
        self.lock()
            .outbox
            .iter()
            .rev()
            .find_map(|message| match message {
                OutboundMessage::MagicCode { email: to, code } if to == email => Some(code.clone()),
                _ => None,
            })
    }

    /// Everything delivered so far
    pub fn outbox(&self) -> Vec<OutboundMessage> {
        self.lock().outbox.clone()
    }

    /// Stable user id for `email`, if the server has seen it
    pub fn user_id_for(&self, email: &str) -> Option<UserId> {
        self.lock().users.get(email).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_online(&self) -> Result<(), AppServerError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppServerError::Unavailable("application server unreachable".to_string()))
        }
    }
}

fn generate_code() -> String {
    format!("{:06}", rand::rng().random_range(0..1_000_000u32))
}

#[async_trait]
impl AppServer for MagicCodeServer {
    async fn request_code(&self, email: &str) -> Result<(), AppServerError> {
        self.check_online()?;
        let email = validate_email(email).map_err(|e| AppServerError::Rejected(e.to_string()))?;

        let mut state = self.lock();
        let code = loop {
            let candidate = generate_code();
            if !state.pending.contains_key(&candidate) {
                break candidate;
            }
        };

        state.pending.insert(
            code.clone(),
            PendingCode {
                email: email.clone(),
                expires_at: Timestamp::now().plus_millis(self.code_ttl.as_millis() as u64),
            },
        );
        state.outbox.push(OutboundMessage::MagicCode { email: email.clone(), code });
        info!(email = %email, "Magic code issued");
        Ok(())
    }

    async fn exchange_code(&self, code: &str) -> Result<SessionCredential, AppServerError> {
        self.check_online()?;
        let code = validate_code(code).map_err(|e| AppServerError::Rejected(e.to_string()))?;

        let mut state = self.lock();
        // Removing up front makes every code single use, expired or not.
        let pending = state
            .pending
            .remove(&code)
            .ok_or_else(|| AppServerError::Rejected("unknown or already used code".to_string()))?;

        if Timestamp::now() >= pending.expires_at {
            debug!(email = %pending.email, "Rejected expired code");
            return Err(AppServerError::Rejected("code expired".to_string()));
        }

        let user_id = state
            .users
            .entry(pending.email.clone())
            .or_insert_with(UserId::generate)
            .clone();

        Ok(SessionCredential::issue(
            &self.signing_key,
            user_id,
            pending.email,
            self.credential_ttl.as_millis() as u64,
        ))
    }

    async fn deliver_invitation(
        &self,
        access_token: &str,
        invitation: &Invitation,
    ) -> Result<(), AppServerError> {
        self.check_online()?;
        if access_token.is_empty() {
            return Err(AppServerError::Unauthorized);
        }
        self.lock().outbox.push(OutboundMessage::Invitation(invitation.clone()));
        info!(invitation = %invitation.id, group = %invitation.group_id, "Invitation delivered");
        Ok(())
    }
}
