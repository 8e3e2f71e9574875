//! In-progress deliveries.
//!
//! A [`WriteHandle`] owns one staging file in `tmp`. It ends in exactly one of
//! two ways: [`WriteHandle::publish`] makes the message visible in `new`, or
//! [`WriteHandle::abort`] deletes it. A handle dropped without either is
//! aborted on a best-effort basis.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::{debug, warn};

use super::durable::sync_dir;
use super::{Maildir, MaildirError, Result};

/// A message being written to the staging directory.
#[derive(Debug)]
pub struct WriteHandle<'a> {
    maildir: &'a Maildir,
    name: String,
    /// `None` once the handle has been published or aborted.
    file: Option<File>,
}

impl<'a> WriteHandle<'a> {
    pub(super) fn create(maildir: &'a Maildir, name: String) -> Result<Self> {
        // create_new: names are unique, so an existing file means something is
        // badly wrong and must not be truncated.
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(maildir.tmp_dir().join(&name))?;

        Ok(WriteHandle {
            maildir,
            name,
            file: Some(file),
        })
    }

    /// Returns the unique file name (`<key>+<token>`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the path of the staging file.
    pub fn staging_path(&self) -> PathBuf {
        self.maildir.tmp_dir().join(&self.name)
    }

    /// Returns the path the message will have once published.
    pub fn published_path(&self) -> PathBuf {
        self.maildir.new_dir().join(&self.name)
    }

    /// Appends `bytes` to the staging file.
    ///
    /// # Errors
    ///
    /// Returns `MaildirError::ShortWrite` if the operating system accepted
    /// fewer bytes than requested. A short write is a failure, not partial
    /// progress: the caller should abort the handle.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(closed)?;
        write_exact(file, bytes)
    }

    /// Publishes the message into `new` and returns its path.
    ///
    /// The staging file is fsynced and closed, hard-linked into `new`, then
    /// unlinked from `tmp`. A crash between the link and the unlink leaves the
    /// complete message visible plus a stray staging copy.
    ///
    /// # Errors
    ///
    /// Returns `MaildirError::Io` if either step fails. The handle is consumed
    /// either way and must not be retried. If the link fails the staging file
    /// is removed; if only the unlink fails the message is already visible.
    pub fn publish(mut self) -> Result<PathBuf> {
        let file = self.file.take().ok_or_else(closed)?;
        let staging = self.staging_path();
        let published = self.published_path();

        let synced = file.sync_all();
        drop(file);
        if let Err(e) = synced.and_then(|()| fs::hard_link(&staging, &published)) {
            discard(&staging);
            return Err(e.into());
        }
        sync_dir(&self.maildir.new_dir())?;

        fs::remove_file(&staging)?;
        sync_dir(&self.maildir.tmp_dir())?;

        debug!(name = %self.name, "Published message");
        Ok(published)
    }

    /// Closes and deletes the staging file without publishing.
    pub fn abort(mut self) -> Result<()> {
        let file = self.file.take().ok_or_else(closed)?;
        drop(file);
        fs::remove_file(self.staging_path())?;
        debug!(name = %self.name, "Aborted message");
        Ok(())
    }
}

impl Drop for WriteHandle<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            warn!(name = %self.name, "Write handle dropped without publish or abort");
            discard(&self.staging_path());
        }
    }
}

/// Issues a single write of `bytes`, failing unless all of them are accepted.
pub(super) fn write_exact<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    let written = writer.write(bytes)?;
    if written != bytes.len() {
        return Err(MaildirError::ShortWrite {
            written,
            expected: bytes.len(),
        });
    }
    Ok(())
}

fn discard(staging: &std::path::Path) {
    if let Err(e) = fs::remove_file(staging)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %staging.display(), error = %e, "Failed to remove staging file");
    }
}

fn closed() -> MaildirError {
    MaildirError::Io(io::Error::other("write handle already closed"))
}
