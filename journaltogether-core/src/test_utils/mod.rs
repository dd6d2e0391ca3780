//! Test utilities and helpers for journaltogether
//!
//! Fixtures for multi-user scenarios over the in-memory collaborators and
//! timeout helpers for async assertions.

pub mod async_helpers;
pub mod fixtures;

pub use async_helpers::*;
pub use fixtures::*;
