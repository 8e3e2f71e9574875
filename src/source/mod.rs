//! Upstream source of pull requests and comments.
//!
//! The reconciler only talks to the [`PullRequestSource`] trait, so it can be
//! driven by the Bitbucket Server client in production and by an in-memory
//! fake in tests.

mod client;
pub mod types;

use thiserror::Error;

pub use client::BitbucketClient;
pub use types::{Activity, Comment, Page, PullRequest, User};

/// Errors returned by an upstream source.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SourceError {
    /// Invalid client configuration.
    #[error("source configuration error: {0}")]
    Configuration(String),

    /// Request transport failed.
    #[error("source transport error: {0}")]
    Transport(String),

    /// The API answered with a non-success status.
    #[error("source API error ({status}): {message}")]
    Api {
        /// HTTP status code returned by the API.
        status: u16,
        /// Error body/message.
        message: String,
    },

    /// The response body could not be parsed.
    #[error("source parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Parse(value.to_string())
        } else {
            Self::Transport(value.to_string())
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}

/// Result type for source operations.
pub type Result<T> = std::result::Result<T, SourceError>;

/// Provider of pull requests, their activity and their diffs.
///
/// Calls are blocking; the reconciler handles one item at a time.
pub trait PullRequestSource {
    /// Lists the pull requests to deliver.
    ///
    /// # Errors
    ///
    /// A failure here abandons the whole run.
    fn pull_requests(&self) -> Result<Vec<PullRequest>>;

    /// Lists the activity stream of a pull request.
    ///
    /// # Errors
    ///
    /// Returns an error when the activity cannot be read.
    fn activities(&self, pr: &PullRequest) -> Result<Vec<Activity>>;

    /// Returns the pull request's diff as plain text.
    ///
    /// # Errors
    ///
    /// Returns an error when the diff cannot be read.
    fn diff(&self, pr: &PullRequest) -> Result<Vec<u8>>;
}
