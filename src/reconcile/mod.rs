//! Reconciliation of upstream pull requests against the mailbox.
//!
//! One run walks every open pull request, then every comment on it, and for
//! each item decides whether to publish, replace or skip. An item's lifecycle:
//!
//! ```text
//! Unseen    -> Delivering -> Delivered
//! Unseen    -> Delivering -> Skipped      (watermark unchanged)
//! Delivered -> Delivering -> Updated      (watermark advanced)
//! ```
//!
//! # Ordering
//!
//! For each item the message is rendered first, then any superseded message
//! is removed, then the new one is published, and only then is the index
//! updated. A failure at any step leaves the index untouched, so the item is
//! reconsidered on the next run.
//!
//! # Bootstrap
//!
//! An item with no index record may still have a published message: the
//! mailbox may predate the index, or a previous run may have crashed between
//! publishing and recording. The message's `X-Bitbucket-Version` header is
//! then the stored watermark. If it is current the record is adopted without
//! writing anything to the mailbox.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::format::{Artifact, MailFormatter, read_watermark};
use crate::index::{IndexError, StateIndex};
use crate::maildir::{Lookup, Maildir, MaildirError};
use crate::source::{Activity, Comment, PullRequest, PullRequestSource, SourceError};
use crate::types::{CommentId, DeliveryKey, InvalidKey, Watermark};


/// Errors that fail a single item. The run continues with the next item.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("invalid delivery key: {0}")]
    InvalidKey(#[from] InvalidKey),

    #[error("mailbox error: {0}")]
    Maildir(#[from] MaildirError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("failed to read headers of {path}: {source}")]
    ReadHeaders {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Several published messages claim one key. Needs operator attention.
    #[error("{count} published messages claim key {key}")]
    Ambiguous { key: DeliveryKey, count: usize },
}

/// Errors that abandon the whole run.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to enumerate pull requests: {0}")]
    Enumerate(#[source] SourceError),
}

/// What to do with an item, given its stored and incoming watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Never delivered: publish a fresh message.
    Publish,
    /// Delivered at an older watermark: supersede the old message.
    Replace,
    /// Already delivered at this watermark or later.
    Skip,
}

/// Decides the action for an item.
pub fn decide(stored: Option<Watermark>, incoming: Watermark) -> Decision {
    match stored {
        None => Decision::Publish,
        Some(stored) if stored >= incoming => Decision::Skip,
        Some(_) => Decision::Replace,
    }
}

/// How an item was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// A first message was published.
    Delivered,
    /// An older message was superseded.
    Updated,
    /// Nothing new.
    Skipped,
    /// A current message was already in the mailbox; only the index changed.
    Adopted,
}

/// How comments nested under other comments are discovered.
///
/// Bitbucket returns replies nested inside their parent comment rather than
/// as activities of their own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommentThreads {
    /// Every reply at every depth is delivered as its own message.
    #[default]
    Nested,
    /// Only comments that start a thread are delivered.
    TopLevel,
}

impl CommentThreads {
    /// Flattens the comments carried by `activities` in delivery order,
    /// pairing each with the comment it replies to.
    ///
    /// Threads are walked depth-first. A comment reachable more than once is
    /// returned once, keeping its parent if any occurrence has one.
    pub fn collect<'a>(
        self,
        activities: &'a [Activity],
    ) -> Vec<(&'a Comment, Option<&'a Comment>)> {
        let mut flat = Vec::new();
        let mut seen: HashMap<CommentId, usize> = HashMap::new();

        for comment in activities.iter().filter_map(Activity::commented) {
            self.walk(comment, None, &mut flat, &mut seen);
        }
        flat
    }

    fn walk<'a>(
        self,
        comment: &'a Comment,
        parent: Option<&'a Comment>,
        flat: &mut Vec<(&'a Comment, Option<&'a Comment>)>,
        seen: &mut HashMap<CommentId, usize>,
    ) {
        match seen.get(&comment.id) {
            Some(&at) => {
                if flat[at].1.is_none() {
                    flat[at].1 = parent;
                }
            }
            None => {
                seen.insert(comment.id, flat.len());
                flat.push((comment, parent));
            }
        }

        if self == CommentThreads::Nested {
            for reply in &comment.comments {
                self.walk(reply, Some(comment), flat, seen);
            }
        }
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub delivered: usize,
    pub updated: usize,
    pub skipped: usize,
    pub adopted: usize,
    pub failed: usize,
}

impl RunReport {
    fn record(&mut self, outcome: &Result<ItemOutcome, ItemError>) {
        match outcome {
            Ok(ItemOutcome::Delivered) => self.delivered += 1,
            Ok(ItemOutcome::Updated) => self.updated += 1,
            Ok(ItemOutcome::Skipped) => self.skipped += 1,
            Ok(ItemOutcome::Adopted) => self.adopted += 1,
            Err(_) => self.failed += 1,
        }
    }

    /// Number of messages written to the mailbox.
    pub fn writes(&self) -> usize {
        self.delivered + self.updated
    }
}

/// Drives one reconciliation run.
#[derive(Debug)]
pub struct Reconciler<'a, S> {
    source: &'a S,
    maildir: &'a Maildir,
    index: &'a StateIndex,
    formatter: &'a MailFormatter,
    threads: CommentThreads,
}

impl<'a, S: PullRequestSource> Reconciler<'a, S> {
    pub fn new(
        source: &'a S,
        maildir: &'a Maildir,
        index: &'a StateIndex,
        formatter: &'a MailFormatter,
    ) -> Self {
        Reconciler {
            source,
            maildir,
            index,
            formatter,
            threads: CommentThreads::default(),
        }
    }

    pub fn with_comment_threads(mut self, threads: CommentThreads) -> Self {
        self.threads = threads;
        self
    }

    /// Reconciles every open pull request and its comments.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Enumerate` if the pull requests cannot be
    /// listed. Failures of individual items are logged and counted in the
    /// report instead.
    pub fn run(&self) -> Result<RunReport, ReconcileError> {
        let pull_requests = self
            .source
            .pull_requests()
            .map_err(ReconcileError::Enumerate)?;
        info!(count = pull_requests.len(), "Reconciling pull requests");

        let mut report = RunReport::default();
        for pr in &pull_requests {
            self.reconcile_pull_request(pr, &mut report);
        }

        info!(
            delivered = report.delivered,
            updated = report.updated,
            skipped = report.skipped,
            adopted = report.adopted,
            failed = report.failed,
            "Run complete"
        );
        Ok(report)
    }

    fn reconcile_pull_request(&self, pr: &PullRequest, report: &mut RunReport) {
        let repo = pr.repo();

        let outcome = DeliveryKey::pull_request(&repo, pr.id)
            .map_err(ItemError::from)
            .and_then(|key| {
                self.reconcile_item(&key, pr.watermark(), || {
                    let diff = self.source.diff(pr)?;
                    Ok(self.formatter.pull_request_mail(pr, &diff))
                })
            });
        log_outcome(&format!("{repo} {}", pr.id), &outcome);
        report.record(&outcome);

        let activities = match self.source.activities(pr) {
            Ok(activities) => activities,
            Err(e) => {
                warn!(repo = %repo, pr = %pr.id, error = %e, "Failed to fetch activities, skipping comments");
                report.failed += 1;
                return;
            }
        };

        for (comment, parent) in self.threads.collect(&activities) {
            let outcome = DeliveryKey::comment(&repo, pr.id, comment.id)
                .map_err(ItemError::from)
                .and_then(|key| {
                    self.reconcile_item(&key, comment.watermark(), || {
                        Ok(self.formatter.comment_mail(pr, comment, parent))
                    })
                });
            log_outcome(&format!("{repo} {} comment {}", pr.id, comment.id), &outcome);
            report.record(&outcome);
        }
    }

    /// Settles one item.
    ///
    /// `render` is only called when a message has to be written, so upstream
    /// data needed just for rendering (a diff) is not fetched for items that
    /// are skipped or adopted.
    ///
    /// # Errors
    ///
    /// Any error leaves the index unchanged for `key`.
    pub fn reconcile_item<F>(
        &self,
        key: &DeliveryKey,
        incoming: Watermark,
        render: F,
    ) -> Result<ItemOutcome, ItemError>
    where
        F: FnOnce() -> Result<Artifact, ItemError>,
    {
        let stored = self.index.watermark(key)?;

        let (decision, existing) = match stored {
            Some(_) => (decide(stored, incoming), None),
            None => match self.lookup(key)? {
                None => (Decision::Publish, None),
                Some(path) => match read_header_watermark(&path)? {
                    Some(found) if decide(Some(found), incoming) == Decision::Skip => {
                        self.index.upsert(key, found)?;
                        return Ok(ItemOutcome::Adopted);
                    }
                    // stale or unreadable: supersede it
                    _ => (Decision::Replace, Some(path)),
                },
            },
        };

        match decision {
            Decision::Skip => Ok(ItemOutcome::Skipped),
            Decision::Publish => {
                let artifact = render()?;
                self.publish(key, &artifact)?;
                Ok(ItemOutcome::Delivered)
            }
            Decision::Replace => {
                let artifact = render()?;
                let existing = match existing {
                    Some(path) => Some(path),
                    None => self.lookup(key)?,
                };
                if let Some(path) = existing {
                    self.maildir.remove(&path)?;
                }
                self.publish(key, &artifact)?;
                Ok(ItemOutcome::Updated)
            }
        }
    }

    fn publish(&self, key: &DeliveryKey, artifact: &Artifact) -> Result<(), ItemError> {
        let path = self.maildir.deliver(key, artifact.bytes())?;
        self.index.upsert(key, artifact.watermark())?;
        debug!(key = %key, path = %path.display(), watermark = %artifact.watermark(), "Recorded delivery");
        Ok(())
    }

    fn lookup(&self, key: &DeliveryKey) -> Result<Option<PathBuf>, ItemError> {
        match self.maildir.lookup(key)? {
            Lookup::NotFound => Ok(None),
            Lookup::Found(path) => Ok(Some(path)),
            Lookup::Ambiguous(count) => Err(ItemError::Ambiguous {
                key: key.clone(),
                count,
            }),
        }
    }
}

fn read_header_watermark(path: &Path) -> Result<Option<Watermark>, ItemError> {
    read_watermark(path).map_err(|source| ItemError::ReadHeaders {
        path: path.to_path_buf(),
        source,
    })
}

fn log_outcome(item: &str, outcome: &Result<ItemOutcome, ItemError>) {
    match outcome {
        Ok(ItemOutcome::Delivered) => info!(item, "Delivered"),
        Ok(ItemOutcome::Updated) => info!(item, "Updated"),
        Ok(ItemOutcome::Adopted) => info!(item, "Adopted existing message"),
        Ok(ItemOutcome::Skipped) => debug!(item, "Unchanged"),
        Err(e @ ItemError::Ambiguous { .. }) => {
            error!(item, error = %e, "Mailbox is inconsistent, resolve manually");
        }
        Err(e) => warn!(item, error = %e, "Item failed, will retry next run"),
    }
}
