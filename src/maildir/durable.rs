//! Mailbox directory helpers.
//!
//! A link or unlink in a mailbox directory is only durable once that
//! directory has been synced.

use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Flushes the entries of a mailbox directory to disk.
pub(super) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Creates `path` and any missing parents, owner-only on Unix.
///
/// Existing directories are left untouched, including their permissions.
pub(super) fn create_private_dir(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}
