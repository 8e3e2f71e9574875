//! Newtype wrappers for upstream identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., using a CommentId
//! where a PrId is expected) and make the code more self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A Bitbucket project key (e.g. `PROJ`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectKey(pub String);

impl ProjectKey {
    pub fn new(s: impl Into<String>) -> Self {
        ProjectKey(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A repository slug within a project (e.g. `my-repo`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoSlug(pub String);

impl RepoSlug {
    pub fn new(s: impl Into<String>) -> Self {
        RepoSlug(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pull request id within a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrId(pub u64);

impl fmt::Display for PrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for PrId {
    fn from(n: u64) -> Self {
        PrId(n)
    }
}

/// A pull request comment id.
///
/// Comment ids are unique across the whole server, not just within a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(pub u64);

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CommentId {
    fn from(n: u64) -> Self {
        CommentId(n)
    }
}

/// A repository within a project, the scope every pull request lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    pub project: ProjectKey,
    pub slug: RepoSlug,
}

impl RepoId {
    pub fn new(project: impl Into<String>, slug: impl Into<String>) -> Self {
        RepoId {
            project: ProjectKey::new(project),
            slug: RepoSlug::new(slug),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.slug)
    }
}

/// The version of an item most recently delivered to the mailbox.
///
/// For pull requests this is the Bitbucket `version` field, for comments the
/// comment's own `version`. Values only ever move forward for a given key; an
/// incoming value that is lower than or equal to the stored one means there is
/// nothing new to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(pub u64);

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Watermark {
    fn from(n: u64) -> Self {
        Watermark(n)
    }
}
