//! Maildir-style delivery store.
//!
//! Messages are delivered into a directory tree shared with mail readers and
//! other delivery agents:
//!
//! ```text
//! <root>/tmp/<key>+<token>   - staging (being written, never "delivered")
//! <root>/new/<key>+<token>   - published, not yet seen by a reader
//! <root>/cur/<key>+<token>:2,<flags> - published and moved by a reader
//! ```
//!
//! # Crash Safety
//!
//! - Messages are written in `tmp`, fsynced, then hard-linked into `new` and
//!   unlinked from `tmp`. Every step is followed by a directory fsync.
//! - A crash before the link leaves only a staging file, which readers never
//!   look at. A crash after the link leaves the message fully visible plus a
//!   harmless staging copy that [`Maildir::sweep_staging`] removes.
//! - Names are unique by construction, so the link never replaces a message.
//!
//! # Lookup
//!
//! Each logical item has at most one published message. [`Maildir::lookup`]
//! scans `new` and `cur` for names starting with `<key>+` and reports zero,
//! one or several matches as distinct [`Lookup`] variants.

mod durable;
pub mod host;
pub mod unique;
mod write;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::DeliveryKey;

use durable::{create_private_dir, sync_dir};
pub use host::{EscapedHostname, HostIdentity, SystemIds};
pub use unique::{DeliveryCounter, UniqueNameError, UniqueNameGenerator};
pub use write::WriteHandle;

/// Staging directory name.
pub const TMP_DIR: &str = "tmp";
/// Published, unseen directory name.
pub const NEW_DIR: &str = "new";
/// Published, seen directory name.
pub const CUR_DIR: &str = "cur";

/// How long a staging file may sit in `tmp` before a sweep removes it.
///
/// Thirty-six hours is the conventional maildir staging lifetime.
pub const DEFAULT_STAGING_MAX_AGE: Duration = Duration::from_secs(36 * 60 * 60);

/// Errors that can occur during mailbox operations.
#[derive(Debug, Error)]
pub enum MaildirError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The operating system accepted fewer bytes than requested.
    #[error("truncated write: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// No unique name could be generated.
    #[error(transparent)]
    UniqueName(#[from] UniqueNameError),
}

/// Result type for mailbox operations.
pub type Result<T> = std::result::Result<T, MaildirError>;

/// Outcome of looking up the published message for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Nothing has been delivered for the key.
    NotFound,
    /// Exactly one message is published for the key.
    Found(PathBuf),
    /// Several messages claim the key. The mailbox is inconsistent and no
    /// match is authoritative.
    Ambiguous(usize),
}

/// A mailbox rooted at a directory.
#[derive(Debug)]
pub struct Maildir {
    root: PathBuf,
    names: UniqueNameGenerator,
}

impl Maildir {
    /// Opens the mailbox at `root`, creating `tmp`, `new` and `cur` if absent.
    ///
    /// # Errors
    ///
    /// Returns `MaildirError::Io` if a directory cannot be created.
    pub fn open(root: impl Into<PathBuf>, names: UniqueNameGenerator) -> Result<Self> {
        let root = root.into();
        for dir in [TMP_DIR, NEW_DIR, CUR_DIR] {
            create_private_dir(&root.join(dir))?;
        }
        debug!(root = %root.display(), "Opened maildir");
        Ok(Maildir { root, names })
    }

    /// Returns the mailbox root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path of the staging directory.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    /// Returns the path of the published, unseen directory.
    pub fn new_dir(&self) -> PathBuf {
        self.root.join(NEW_DIR)
    }

    /// Returns the path of the published, seen directory.
    pub fn cur_dir(&self) -> PathBuf {
        self.root.join(CUR_DIR)
    }

    /// Starts a delivery for `key` by creating a fresh staging file.
    ///
    /// The file is named `<key>+<token>`, so two deliveries of the same key
    /// never collide, even before either is published.
    ///
    /// # Errors
    ///
    /// Returns `MaildirError::Io` if the staging file cannot be created, and
    /// `MaildirError::UniqueName` if no token can be generated.
    pub fn begin_write(&self, key: &DeliveryKey) -> Result<WriteHandle<'_>> {
        let name = format!("{}{}", key.file_prefix(), self.names.next()?);
        WriteHandle::create(self, name)
    }

    /// Writes `bytes` as a complete message for `key` and publishes it.
    ///
    /// On any failure before publishing, the staging file is removed.
    /// Returns the published path.
    pub fn deliver(&self, key: &DeliveryKey, bytes: &[u8]) -> Result<PathBuf> {
        self.deliver_with(key, |handle| handle.write(bytes))
    }

    fn deliver_with<F>(&self, key: &DeliveryKey, fill: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut WriteHandle<'_>) -> Result<()>,
    {
        let mut handle = self.begin_write(key)?;
        if let Err(e) = fill(&mut handle) {
            if let Err(abort_err) = handle.abort() {
                warn!(key = %key, error = %abort_err, "Failed to remove staging file after write error");
            }
            return Err(e);
        }
        handle.publish()
    }

    /// Finds the published message for `key` in `new` and `cur`.
    ///
    /// `new` is scanned before `cur`. A message a reader moves from `new` to
    /// `cur` between the two scans is seen twice under the same unique part
    /// and counted once, so concurrent readers never cause a spurious
    /// `Ambiguous` or a missed message.
    ///
    /// # Errors
    ///
    /// Returns `MaildirError::Io` if either directory cannot be read.
    pub fn lookup(&self, key: &DeliveryKey) -> Result<Lookup> {
        // unique part (name without maildir info) -> most recently seen path
        let mut matches: HashMap<String, PathBuf> = HashMap::new();

        for dir in [self.new_dir(), self.cur_dir()] {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                    continue;
                };
                if name.starts_with('.') || !key.matches_file_name(&name) {
                    continue;
                }
                matches.insert(unique_part(&name).to_owned(), entry.path());
            }
        }

        Ok(match matches.len() {
            0 => Lookup::NotFound,
            1 => match matches.into_values().next() {
                Some(path) => Lookup::Found(path),
                None => Lookup::NotFound,
            },
            n => Lookup::Ambiguous(n),
        })
    }

    /// Deletes a published message, superseding an out-of-date delivery.
    ///
    /// # Errors
    ///
    /// Returns `MaildirError::Io` if the file cannot be removed, including
    /// when a reader has moved it since it was looked up.
    pub fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        if let Some(parent) = path.parent() {
            sync_dir(parent)?;
        }
        debug!(path = %path.display(), "Removed superseded message");
        Ok(())
    }

    /// Removes leftover staging files.
    ///
    /// A staging file is removed when a message with the same unique part is
    /// already published (a crash between link and unlink), or when it is
    /// older than `max_age` (an abandoned delivery). Published messages are
    /// never touched.
    ///
    /// Returns the number of staging files removed.
    pub fn sweep_staging(&self, max_age: Duration) -> Result<usize> {
        let published = self.published_unique_parts()?;
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let tmp = self.tmp_dir();
        let mut removed = 0;

        for entry in fs::read_dir(&tmp)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };

            let already_published = published.contains(&name);
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .is_ok_and(|modified| modified < cutoff);

            if !(already_published || expired) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(name = %name, already_published, expired, "Removed staging file");
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove staging file");
                }
            }
        }

        if removed > 0 {
            sync_dir(&tmp)?;
            info!(removed, "Swept staging directory");
        }

        Ok(removed)
    }

    fn published_unique_parts(&self) -> Result<HashSet<String>> {
        let mut parts = HashSet::new();
        for dir in [self.new_dir(), self.cur_dir()] {
            for entry in fs::read_dir(&dir)? {
                if let Some(name) = entry?.file_name().to_str() {
                    parts.insert(unique_part(name).to_owned());
                }
            }
        }
        Ok(parts)
    }
}

/// Strips the maildir info suffix (`:2,<flags>`) a reader may append in `cur`.
fn unique_part(name: &str) -> &str {
    name.split_once(':').map_or(name, |(unique, _)| unique)
}
