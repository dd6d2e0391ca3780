//! Data model shared by the session and membership subsystems

pub mod group;
pub mod identity;
pub mod invitation;
pub mod types;
pub mod validation;

pub use group::{Group, Member};
pub use identity::{AuthState, Identity};
pub use invitation::Invitation;
pub use types::{GroupId, InvitationId, Timestamp, UserId};
pub use validation::ValidationError;
