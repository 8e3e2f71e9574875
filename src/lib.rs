//! pr-maildir: delivers Bitbucket Server pull requests and their comments into
//! a maildir, exactly once per version.
//!
//! The library is split along the delivery pipeline:
//!
//! - [`source`] lists pull requests, activities and diffs from upstream
//! - [`format`] renders each item as a mail message
//! - [`maildir`] publishes messages atomically into `tmp`/`new`/`cur`
//! - [`index`] remembers the last delivered watermark per item
//! - [`reconcile`] ties them together for one run

pub mod config;
pub mod format;
pub mod index;
pub mod maildir;
pub mod reconcile;
pub mod source;
pub mod types;

#[cfg(test)]
mod test_utils;
