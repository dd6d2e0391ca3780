//! Session bootstrap
//!
//! Exchanges a one-time magic code for a durable session without ever
//! handling a password, and publishes the current identity as a live signal
//! for the rest of the system.

pub mod app_server;
pub mod auth;
pub mod bootstrap;
pub mod credential;
pub mod errors;

pub use app_server::{AppServer, MagicCodeServer, OutboundMessage};
pub use auth::{AuthProvider, AuthSession, MemoryAuthProvider};
pub use bootstrap::{IdentityWatch, SessionBootstrap};
pub use credential::{SessionCredential, SigningKey};
pub use errors::{AppServerError, AuthError, SessionError, SessionResult};
