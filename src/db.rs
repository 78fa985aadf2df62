use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use crate::transform::NormalizedRecord;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unreachable: {0}")]
    Connectivity(#[source] rusqlite::Error),
    #[error("storage permission denied: {0}")]
    Permission(#[source] rusqlite::Error),
    #[error("unexpected constraint violation: {0}")]
    ConstraintUnexpected(#[source] rusqlite::Error),
    #[error("storage error: {0}")]
    Other(#[source] rusqlite::Error),
}

impl StorageError {
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::Connectivity(_) => "connectivity",
            StorageError::Permission(_) => "permission",
            StorageError::ConstraintUnexpected(_) => "constraint",
            StorageError::Other(_) => "other",
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        let code = match &e {
            rusqlite::Error::SqliteFailure(f, _) => f.code,
            _ => return StorageError::Other(e),
        };
        match code {
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure => StorageError::Connectivity(e),
            ErrorCode::PermissionDenied
            | ErrorCode::ReadOnly
            | ErrorCode::AuthorizationForStatementDenied => StorageError::Permission(e),
            ErrorCode::ConstraintViolation => StorageError::ConstraintUnexpected(e),
            _ => StorageError::Other(e),
        }
    }
}

/// Result of a load: both variants are success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Inserted,
    AlreadyPresent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: i64,
    pub title: String,
    pub explanation: String,
    pub media_url: String,
    pub date: String,
    pub media_type: String,
}

pub struct Stats {
    pub rows: usize,
    pub first_date: Option<String>,
    pub last_date: Option<String>,
}

/// One SQLite connection. Each run, process or thread opens its own.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    StorageError::Connectivity(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                        Some(format!("cannot create {}: {}", dir.display(), e)),
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        debug!("Opened storage at {}", path.display());
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            conn: Connection::open_in_memory().unwrap(),
        }
    }

    /// Create `apod_data` if absent. Safe to call on every run.
    pub fn ensure_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS apod_data (
                id          INTEGER PRIMARY KEY,
                title       TEXT,
                explanation TEXT,
                url         TEXT,
                date        DATE NOT NULL UNIQUE CHECK (date IS date(date)),
                media_type  TEXT
            );
            ",
        )?;
        Ok(())
    }

    /// Insert one row; an existing row for the same date wins and is left untouched.
    pub fn load(&self, record: &NormalizedRecord) -> Result<LoadOutcome, StorageError> {
        let changed = self.conn.execute(
            "INSERT INTO apod_data (title, explanation, url, date, media_type)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (date) DO NOTHING",
            rusqlite::params![
                record.title,
                record.explanation,
                record.media_url,
                record.date,
                record.media_type,
            ],
        )?;
        Ok(if changed == 0 {
            LoadOutcome::AlreadyPresent
        } else {
            LoadOutcome::Inserted
        })
    }

    pub fn fetch_by_date(&self, date: &str) -> Result<Option<StoredRecord>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, title, explanation, url, date, media_type
                 FROM apod_data WHERE date = ?1",
                [date],
                stored_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Newest first.
    pub fn fetch_recent(&self, limit: usize) -> Result<Vec<StoredRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, explanation, url, date, media_type
             FROM apod_data ORDER BY date DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], stored_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_stats(&self) -> Result<Stats, StorageError> {
        let (rows, first_date, last_date) = self.conn.query_row(
            "SELECT COUNT(*), MIN(date), MAX(date) FROM apod_data",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        Ok(Stats {
            rows,
            first_date,
            last_date,
        })
    }
}

fn stored_from_row(row: &rusqlite::Row) -> rusqlite::Result<StoredRecord> {
    Ok(StoredRecord {
        id: row.get(0)?,
        title: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        explanation: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        media_url: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        date: row.get(4)?,
        media_type: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
    })
}
