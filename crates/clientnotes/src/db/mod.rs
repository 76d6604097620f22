//! Database module for persistent job history.
//!
//! Uses rusqlite (SQLite) with a thread-safe `Database` handle.
//! All access is serialized through a `Mutex<Connection>`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;

pub mod error;
pub mod job_repo;
pub mod log_repo;
pub mod migrations;

pub use error::DatabaseError;

/// How long a writer waits on a lock held by another connection (a second
/// process on the same file) before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Thread-safe database handle wrapping a single rusqlite connection.
///
/// Cloning is cheap (inner `Arc`). Workers write through the job store
/// while readers poll, so WAL mode is enabled on file databases.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database at the given path and runs all
    /// pending migrations.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn)?;

        log::info!(
            "Job database opened at {} (schema v{})",
            path.display(),
            migrations::current_version(&conn)?
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database for testing. Runs all migrations.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Provides locked access to the underlying connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }
}

/// Returns the canonical database path: `~/.clientnotes/data/clientnotes.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".clientnotes").join("data").join("clientnotes.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_is_migrated() {
        let db = Database::open_in_memory().unwrap();
        let version = db.with_conn(migrations::current_version).unwrap();
        assert!(version > 0);
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");

        Database::open(&path)
            .unwrap()
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO jobs (id, kind, range_start, range_end, status, created_at, updated_at)
                     VALUES ('kept', 'manual', '2024-01-01', '2024-01-07', 'completed', '2024-01-01', '2024-01-01')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let reopened = Database::open(&path).unwrap();
        let status: String = reopened
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT status FROM jobs WHERE id = 'kept'", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(status, "completed");
    }

    #[test]
    fn test_open_file_db_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.db");
        let db = Database::open(&path).unwrap();
        db.with_conn(|conn| {
            let count: u32 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?;
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_default_database_path() {
        let path = default_database_path().unwrap();
        assert!(path.ends_with("clientnotes.db"));
        assert!(path.to_string_lossy().contains(".clientnotes"));
    }
}
