//! EPG store: SQLite-backed persistence for programmes, recording and
//! viewing history, and per-channel UTC offsets.
//!
//! All programme access goes through the merge/insert and query methods in
//! [`programme`]; recording and viewing history live in [`record`]. Times
//! are stored as unix seconds and exposed as [`chrono`] values.

mod models;
mod programme;
mod record;
mod schema;

pub use models::*;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;

/// Days of programme, recording and viewing history to keep.
pub const DAYS_IN_HISTORY: i64 = 12 * 7;

/// Database error types.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Shared handle used by the scheduler and background tasks.
pub type DatabaseHandle = Arc<tokio::sync::Mutex<Database>>;

/// Main database connection wrapper.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.initialize_schema()?;
        Ok(db)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch(schema::SCHEMA_SQL)?;
        Ok(())
    }

    /// Delete programmes, records and views older than [`DAYS_IN_HISTORY`].
    pub fn clean(&self, now: DateTime<Utc>) -> Result<()> {
        let cutoff = ts(now - chrono::Duration::days(DAYS_IN_HISTORY));

        self.conn.execute(
            "DELETE FROM programmes WHERE utc_start < ?1",
            rusqlite::params![cutoff],
        )?;
        self.conn.execute(
            "DELETE FROM records WHERE end_utc < ?1",
            rusqlite::params![cutoff],
        )?;
        self.conn.execute(
            "DELETE FROM views WHERE end_utc < ?1",
            rusqlite::params![cutoff],
        )?;

        Ok(())
    }

    /// The UTC offset (seconds) learned for a channel, if any.
    pub fn utc_offset(&self, raw_channel: &str) -> Result<Option<i64>> {
        let result = self.conn.query_row(
            "SELECT utc_offset_secs FROM channel_offsets WHERE raw_channel = ?1",
            rusqlite::params![raw_channel],
            |row| row.get(0),
        );

        match result {
            Ok(offset) => Ok(Some(offset)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DatabaseError::Sqlite(e)),
        }
    }

    /// Persist a channel's UTC offset. The offset is rounded to whole
    /// minutes to absorb clock jitter, and an existing value is only
    /// rewritten when the new observation moves by more than a minute.
    pub fn set_utc_offset(&self, raw_channel: &str, offset_secs: i64) -> Result<()> {
        let rounded = ((offset_secs + 30).div_euclid(60)) * 60;

        if let Some(existing) = self.utc_offset(raw_channel)? {
            if (existing - rounded).abs() <= 60 {
                return Ok(());
            }
        }

        self.conn.execute(
            "INSERT INTO channel_offsets (raw_channel, utc_offset_secs, updated_at)
             VALUES (?1, ?2, strftime('%s', 'now'))
             ON CONFLICT(raw_channel) DO UPDATE
             SET utc_offset_secs = ?2, updated_at = strftime('%s', 'now')",
            rusqlite::params![raw_channel, rounded],
        )?;
        Ok(())
    }

    /// The underlying connection (for advanced queries).
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

/// Unix seconds for a UTC instant.
pub(crate) fn ts(time: DateTime<Utc>) -> i64 {
    time.timestamp()
}

/// UTC instant from unix seconds.
pub(crate) fn dt(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Naive wall-clock time from stored seconds.
pub(crate) fn naive(secs: i64) -> NaiveDateTime {
    dt(secs).naive_utc()
}

/// Stored seconds for a naive wall-clock time.
pub(crate) fn naive_ts(time: NaiveDateTime) -> i64 {
    time.and_utc().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_creates_schema() {
        let db = Database::open_in_memory().unwrap();

        let count: i32 = db
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('programmes', 'records', 'views', 'channel_offsets')",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert_eq!(count, 4);
    }

    #[test]
    fn utc_offset_rounds_and_dampens_jitter() {
        let db = Database::open_in_memory().unwrap();

        assert_eq!(db.utc_offset("BBCONE").unwrap(), None);

        db.set_utc_offset("BBCONE", 3592).unwrap();
        assert_eq!(db.utc_offset("BBCONE").unwrap(), Some(3600));

        // 35 seconds of drift is jitter, not a new offset.
        db.set_utc_offset("BBCONE", 3635).unwrap();
        assert_eq!(db.utc_offset("BBCONE").unwrap(), Some(3600));

        // A real change (DST) is applied.
        db.set_utc_offset("BBCONE", 7205).unwrap();
        assert_eq!(db.utc_offset("BBCONE").unwrap(), Some(7200));
    }
}
