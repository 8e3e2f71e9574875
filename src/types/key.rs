//! Delivery keys: stable identities for logical upstream items.
//!
//! A delivery key names one logical item (a pull request, a comment) across
//! runs. It is the primary key of the state index and the file name prefix of
//! every message delivered for that item.
//!
//! # Key Formats
//!
//! - pull request: `<project>.<repo>.pr.<id>`
//! - comment: `<project>.<repo>.pr.<id>.comment.<comment_id>`
//!
//! Published file names are `<key>+<unique-token>`. The `+` separator is
//! rejected inside keys, so matching on `<key>+` can never pick up a file that
//! belongs to a different key, even when one key is a textual prefix of another
//! (`PROJ.repo.pr.1` vs `PROJ.repo.pr.12`).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{CommentId, PrId, RepoId};

/// Separator between a delivery key and the unique token in a file name.
pub const KEY_SEPARATOR: char = '+';

/// A key was rejected because it cannot be used as a file name prefix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid delivery key {key:?}: {reason}")]
pub struct InvalidKey {
    pub key: String,
    pub reason: &'static str,
}

/// A stable identifier for one logical item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeliveryKey(String);

impl DeliveryKey {
    /// Validates and wraps a raw key.
    ///
    /// A key is rejected if it:
    /// - Is empty
    /// - Contains path separators (`/` or `\`) or null bytes
    /// - Contains the file name separator `+`
    /// - Contains `:` (reserved for maildir info suffixes)
    /// - Starts with a dot (hidden file)
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidKey> {
        let key = raw.into();
        let reason = if key.is_empty() {
            Some("empty")
        } else if key.contains(['/', '\\', '\0']) {
            Some("contains a path separator or null byte")
        } else if key.contains(KEY_SEPARATOR) {
            Some("contains the file name separator '+'")
        } else if key.contains(':') {
            Some("contains ':'")
        } else if key.starts_with('.') {
            Some("starts with '.'")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(InvalidKey { key, reason }),
            None => Ok(DeliveryKey(key)),
        }
    }

    /// Creates the key for a pull request.
    pub fn pull_request(repo: &RepoId, pr: PrId) -> Result<Self, InvalidKey> {
        Self::parse(format!("{}.{}.pr.{}", repo.project, repo.slug, pr.0))
    }

    /// Creates the key for a comment (or nested reply) on a pull request.
    pub fn comment(repo: &RepoId, pr: PrId, comment: CommentId) -> Result<Self, InvalidKey> {
        Self::parse(format!(
            "{}.{}.pr.{}.comment.{}",
            repo.project, repo.slug, pr.0, comment.0
        ))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the file name prefix shared by every delivery of this key.
    pub fn file_prefix(&self) -> String {
        format!("{}{}", self.0, KEY_SEPARATOR)
    }

    /// Returns true if `file_name` was delivered for this key.
    pub fn matches_file_name(&self, file_name: &str) -> bool {
        file_name
            .strip_prefix(self.0.as_str())
            .is_some_and(|rest| rest.starts_with(KEY_SEPARATOR))
    }
}

impl fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for DeliveryKey {
    type Error = InvalidKey;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<DeliveryKey> for String {
    fn from(key: DeliveryKey) -> Self {
        key.0
    }
}
