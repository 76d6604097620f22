//! Versioned schema migrations.
//!
//! Applied versions are recorded in `_migrations`. Each pending migration
//! runs in its own transaction together with its version row, so a failed
//! migration leaves the schema at the previous version.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Versions must be strictly increasing.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_jobs_table",
        sql: include_str!("sql/001_create_jobs.sql"),
    },
    Migration {
        version: 2,
        description: "create_job_logs_table",
        sql: include_str!("sql/002_create_job_logs.sql"),
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    apply(conn, MIGRATIONS)
}

/// Highest applied version, 0 on a fresh database.
pub fn current_version(conn: &Connection) -> Result<u32, DatabaseError> {
    ensure_tracking_table(conn)?;
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;
    Ok(version)
}

fn ensure_tracking_table(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    Ok(())
}

fn apply(conn: &Connection, migrations: &[Migration]) -> Result<(), DatabaseError> {
    let current = current_version(conn)?;
    let pending: Vec<&Migration> = migrations.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        log::debug!("Database schema up to date at v{}", current);
        return Ok(());
    }

    for migration in pending {
        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        let failed = |e: rusqlite::Error| DatabaseError::Migration {
            version: migration.version,
            reason: e.to_string(),
        };

        // Dropped without commit on any error, which rolls the migration back.
        let tx = conn.unchecked_transaction().map_err(failed)?;
        tx.execute_batch(migration.sql).map_err(failed)?;
        tx.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )
        .map_err(failed)?;
        tx.commit().map_err(failed)?;
    }

    Ok(())
}
