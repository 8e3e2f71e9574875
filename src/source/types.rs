//! Bitbucket Server REST records.
//!
//! Only the fields the formatter and reconciler need are modelled; unknown
//! fields are ignored. Timestamps are milliseconds since the Unix epoch, as
//! the API sends them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{CommentId, PrId, ProjectKey, RepoId, RepoSlug, Watermark};

/// Action value of activities that carry a comment.
pub const COMMENTED: &str = "COMMENTED";

/// One page of a paged collection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub values: Vec<T>,
    #[serde(default = "default_true")]
    pub is_last_page: bool,
    #[serde(default)]
    pub next_page_start: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// A pull request as listed on the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub id: PrId,
    pub version: u64,
    pub created_date: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub author: Participant,
    pub to_ref: Ref,
    #[serde(default)]
    pub links: HashMap<String, Vec<Link>>,
}

impl PullRequest {
    /// The repository the pull request merges into.
    pub fn repo(&self) -> RepoId {
        RepoId {
            project: self.to_ref.repository.project.key.clone(),
            slug: self.to_ref.repository.slug.clone(),
        }
    }

    /// The browser link for the pull request, if the server sent one.
    pub fn self_link(&self) -> Option<&str> {
        self.links
            .get("self")
            .and_then(|links| links.first())
            .map(|link| link.href.as_str())
    }

    pub fn watermark(&self) -> Watermark {
        Watermark(self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Participant {
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub email_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Ref {
    pub repository: Repository,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Repository {
    pub slug: RepoSlug,
    pub project: Project,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Project {
    pub key: ProjectKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Link {
    pub href: String,
}

/// An entry in a pull request's activity stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: u64,
    pub created_date: i64,
    pub action: String,
    #[serde(default)]
    pub comment: Option<Comment>,
}

impl Activity {
    /// Returns the comment this activity created, if it is a comment activity.
    pub fn commented(&self) -> Option<&Comment> {
        if self.action == COMMENTED {
            self.comment.as_ref()
        } else {
            None
        }
    }
}

/// A comment, with its replies nested beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub version: u64,
    #[serde(default)]
    pub text: String,
    pub author: User,
    #[serde(default)]
    pub created_date: i64,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl Comment {
    pub fn watermark(&self) -> Watermark {
        Watermark(self.version)
    }
}
