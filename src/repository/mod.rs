//! SQLite persistence layer.
//!
//! All status mutations run inside `BEGIN IMMEDIATE` transactions, which
//! take the database write lock up front. That lock is this repository's
//! row-locking discipline: Phase A and Phase C of the orchestrator hold
//! it, Phase B never does.

mod document;

pub use document::{AcquireOutcome, CommitOutcome, DocumentRepository};

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Parse a datetime string from the database, defaulting to the Unix
/// epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse an optional datetime string from the database.
pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Treat QueryReturnedNoRows as None.
pub fn to_option<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Open a connection with the concurrency settings every caller needs.
pub fn connect(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;

    // WAL allows concurrent readers while one writer holds the lock.
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 30000;
    "#,
    )?;

    Ok(conn)
}

/// Create all tables and indices. Invoked by `brant migrate` and by every
/// repository constructor.
pub fn run_migrations(db_path: &Path) -> Result<Vec<String>> {
    let _docs = DocumentRepository::new(db_path)?;
    let _queue = crate::queue::JobQueue::new(db_path)?;

    let conn = connect(db_path)?;
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(tables)
}
