//! Group membership reconciliation
//!
//! Mirrors the signed-in user's membership index (`users/{uid}/groups`) into
//! one live subscription per group document and publishes the merged result.
//!
//! ## Guarantees
//!
//! 1. Every indexed id has exactly one subscription slot, and no slot outlives
//!    its id
//! 2. A group leaves the snapshot in the same update that closes its slot
//! 3. Losing the index is reported as `Failed`, never as "no groups"
//! 4. After `stop()` returns, no feed event reaches the snapshot

pub mod errors;
mod handle;
mod operations;
pub mod reconciler;
pub mod snapshot;

#[cfg(test)]
mod tests;

pub use errors::{MembershipError, MembershipResult};
pub use reconciler::MembershipReconciler;
pub use snapshot::{Snapshot, SnapshotStatus, SnapshotWatch};
