//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// A stored row could not be mapped back to a domain value.
    #[error("Corrupt {table} row '{id}': {reason}")]
    CorruptRow {
        table: &'static str,
        id: String,
        reason: String,
    },

    #[error("Database lock poisoned")]
    LockPoisoned,
}
