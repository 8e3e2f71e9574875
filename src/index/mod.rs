//! `SQLite`-backed delivery state index.
//!
//! Maps each [`DeliveryKey`] to the [`Watermark`] of its most recent
//! successful delivery. The index is the durable memory of what has been
//! delivered: an item with no row is retried on the next run.
//!
//! Writes are single `INSERT ... ON CONFLICT DO UPDATE` statements, so an
//! upsert is atomic on its own and two processes sharing one database never
//! lose an update to a read-modify-write race.

// SQLite stores integers as i64. Watermarks are u64 in memory and checked on
// the way in, so the only conversions back are of values we wrote ourselves.
#![allow(clippy::cast_sign_loss)]

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use thiserror::Error;
use tracing::debug;

use crate::types::{DeliveryKey, Watermark};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors that can occur during index operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IndexError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error while preparing the database location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The watermark does not fit in an `SQLite` integer.
    #[error("watermark {0} exceeds the storable range")]
    WatermarkOutOfRange(Watermark),

    /// A stored key no longer passes validation.
    #[error("corrupt index row: {0}")]
    CorruptRow(String),
}

/// Result type for index operations.
pub type Result<T> = std::result::Result<T, IndexError>;

/// One row of the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub key: DeliveryKey,
    pub watermark: Watermark,
    /// Unix seconds of the last upsert.
    pub updated_at: i64,
}

/// The persisted key to watermark mapping.
#[derive(Debug)]
pub struct StateIndex {
    conn: Connection,
    path: Option<PathBuf>,
}

impl StateIndex {
    /// Opens (creating if necessary) the index database at `path`.
    ///
    /// Missing parent directories are created. Schema creation is idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        Self::initialize_connection(&conn)?;
        debug!(path = %path.display(), "Opened state index");

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory index for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;
        Ok(Self { conn, path: None })
    }

    fn initialize_connection(conn: &Connection) -> Result<()> {
        // Execute schema (includes PRAGMA statements)
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Returns the database path, or `None` for an in-memory index.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns true if `key` has been delivered at least once.
    pub fn exists(&self, key: &DeliveryKey) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM deliveries WHERE delivery_key = ?1)",
            params![key.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Returns the watermark of the last delivery of `key`, if any.
    pub fn watermark(&self, key: &DeliveryKey) -> Result<Option<Watermark>> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "SELECT watermark FROM deliveries WHERE delivery_key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|v| Watermark(v as u64)))
    }

    /// Records that `key` was delivered at `watermark`.
    ///
    /// Inserts a new row or replaces the stored watermark unconditionally, in
    /// one statement. Callers only pass watermarks at least as high as the
    /// stored one.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::WatermarkOutOfRange` if the watermark does not fit
    /// in an `SQLite` integer, or a database error.
    pub fn upsert(&self, key: &DeliveryKey, watermark: Watermark) -> Result<()> {
        let stored =
            i64::try_from(watermark.0).map_err(|_| IndexError::WatermarkOutOfRange(watermark))?;

        self.conn.execute(
            "INSERT INTO deliveries (delivery_key, watermark, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(delivery_key) DO UPDATE
             SET watermark = excluded.watermark, updated_at = excluded.updated_at",
            params![key.as_str(), stored, unix_now()],
        )?;
        Ok(())
    }

    /// Returns the number of recorded keys.
    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM deliveries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Returns true if nothing has been delivered yet.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns the full record for `key`.
    pub fn record(&self, key: &DeliveryKey) -> Result<Option<IndexRecord>> {
        let row: Option<(String, i64, i64)> = self
            .conn
            .query_row(
                "SELECT delivery_key, watermark, updated_at FROM deliveries WHERE delivery_key = ?1",
                params![key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(to_record).transpose()
    }

    /// Returns every record whose key starts with `prefix`, ordered by key.
    pub fn records_with_prefix(&self, prefix: &str) -> Result<Vec<IndexRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT delivery_key, watermark, updated_at FROM deliveries
             WHERE substr(delivery_key, 1, length(?1)) = ?1
             ORDER BY delivery_key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(to_record(row?)?);
        }
        Ok(records)
    }
}

fn to_record((key, watermark, updated_at): (String, i64, i64)) -> Result<IndexRecord> {
    let key = DeliveryKey::parse(key).map_err(|e| IndexError::CorruptRow(e.to_string()))?;
    Ok(IndexRecord {
        key,
        watermark: Watermark(watermark as u64),
        updated_at,
    })
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
