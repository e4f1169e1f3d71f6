//! Persistent state store backed by SQLite
//!
//! One connection, one writer of record. Callers share it as
//! [`SharedStore`]; every multi-row update runs inside a transaction on
//! that connection.

mod execution;
mod ledger;
mod learning;
mod org;
pub mod schema;
pub mod types;
mod views;

pub use learning::PatternDetection;
pub use ledger::REWARD_METRIC;
pub use types::*;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Row};
use tracing::info;

use crate::{Error, Result};

/// Store shared between the supervisor, reconciler and HTTP handlers
pub type SharedStore = Arc<Mutex<Store>>;

/// SQLite-based state store
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `db_path` and run migrations.
    pub fn new(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        schema::migrate(&conn)?;

        info!("State store opened at {}", db_path);
        Ok(Self { conn })
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }
}

/// Lock a shared store, surfacing a poisoned mutex as an error.
pub fn lock(store: &SharedStore) -> Result<MutexGuard<'_, Store>> {
    store
        .lock()
        .map_err(|_| Error::Other("state store mutex poisoned".to_string()))
}

/// Canonical timestamp text: UTC, millisecond precision, `Z` suffix.
pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn now_ts() -> String {
    ts(&Utc::now())
}

fn parse_ts(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Read a non-null timestamp column.
pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_ts(idx, &text)
}

/// Read a nullable timestamp column.
pub(crate) fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| parse_ts(idx, &t)).transpose()
}

/// Read a JSON text column.
pub(crate) fn json_col<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Turn "no rows" into `None`.
pub(crate) fn optional<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::from(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_format_sorts_lexically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::milliseconds(1);
        assert_eq!(ts(&a), "2026-01-02T03:04:05.000Z");
        assert!(ts(&a) < ts(&b));
    }

    #[test]
    fn test_file_store_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("overseer.db");
        let store = Store::new(path.to_str().unwrap()).unwrap();
        assert!(path.exists());
        drop(store);

        // reopening runs migrations again without error
        Store::new(path.to_str().unwrap()).unwrap();
    }

    #[test]
    fn test_lock_shared_store() {
        let shared = Store::in_memory().unwrap().into_shared();
        let guard = lock(&shared).unwrap();
        assert!(guard.list_teams().unwrap().is_empty());
    }
}
