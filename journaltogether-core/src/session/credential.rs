//! Signed session credentials
//!
//! The application server signs a credential after a successful code exchange;
//! the auth service verifies it with the same key before opening a session.

use crate::model::types::{Timestamp, UserId};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key used to MAC session credentials
#[derive(Clone)]
pub struct SigningKey {
    id: String,
    secret: [u8; 32],
}

impl SigningKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            secret,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn mac(&self, payload: &[u8]) -> blake3::Hash {
        blake3::keyed_hash(&self.secret, payload)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Credential returned by the code exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredential {
    pub user_id: UserId,
    pub email: String,
    pub issued_at: Timestamp,
    pub expires_at: Timestamp,
    pub key_id: String,
    /// Hex-encoded keyed BLAKE3 MAC over the other fields
    pub signature: String,
}

impl SessionCredential {
    /// Issue and sign a credential valid for `ttl_millis`
    pub fn issue(key: &SigningKey, user_id: UserId, email: String, ttl_millis: u64) -> Self {
        let issued_at = Timestamp::now();
        let mut credential = SessionCredential {
            user_id,
            email,
            issued_at,
            expires_at: issued_at.plus_millis(ttl_millis),
            key_id: key.id().to_string(),
            signature: String::new(),
        };
        credential.signature = hex::encode(key.mac(&credential.payload()).as_bytes());
        credential
    }

    /// Check the signature against `key`. Comparison is constant time.
    pub fn verify(&self, key: &SigningKey) -> bool {
        if self.key_id != key.id() {
            return false;
        }
        let Ok(bytes) = hex::decode(&self.signature) else {
            return false;
        };
        let Ok(bytes) = <[u8; 32]>::try_from(bytes.as_slice()) else {
            return false;
        };
        blake3::Hash::from(bytes) == key.mac(&self.payload())
    }

    fn payload(&self) -> Vec<u8> {
        format!(
            "{}\n{}\n{}\n{}\n{}",
            self.key_id,
            self.user_id,
            self.email,
            self.issued_at.as_millis(),
            self.expires_at.as_millis()
        )
        .into_bytes()
    }
}
