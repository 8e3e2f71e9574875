//! Core domain types for the delivery engine.
//!
//! This module contains the identifiers shared by the mailbox, the state index
//! and the reconciler.

pub mod ids;
pub mod key;

// Re-export commonly used types at the module level
pub use ids::{CommentId, PrId, ProjectKey, RepoId, RepoSlug, Watermark};
pub use key::{DeliveryKey, InvalidKey, KEY_SEPARATOR};
