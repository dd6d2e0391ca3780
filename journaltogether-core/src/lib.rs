//! journaltogether core
//!
//! Passwordless session bootstrap and live group membership for the
//! journaltogether service.
//!
//! - [`session`]: magic-code sign-in and the current identity signal
//! - [`membership`]: the membership reconciler and group operations
//! - [`remote`]: the document/index store collaborator
//! - [`client`]: a facade that wires the two subsystems together

pub mod client;
pub mod config;
pub mod logging;
pub mod membership;
pub mod metrics;
pub mod model;
pub mod remote;
pub mod session;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use client::{InMemoryBackend, JournalClient};
pub use config::{Config, ConfigError};
pub use logging::{init_logging, LogLevel};
pub use membership::{MembershipError, MembershipReconciler, Snapshot, SnapshotStatus};
pub use model::{AuthState, Group, GroupId, Identity, UserId};
pub use session::{SessionBootstrap, SessionError};
