//! Log repository: append-only entries in the `job_logs` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub job_id: String,
    pub seq: u64,
    pub timestamp: String,
    pub message: String,
}

impl LogRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            seq: row.get("seq")?,
            timestamp: row.get("timestamp")?,
            message: row.get("message")?,
        })
    }
}

/// Appends one entry. Re-appending an existing `(job_id, seq)` is a no-op.
pub fn append(db: &Database, entry: &LogRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT OR IGNORE INTO job_logs (job_id, seq, timestamp, message)
             VALUES (?1, ?2, ?3, ?4)",
            params![entry.job_id, entry.seq, entry.timestamp, entry.message],
        )?;
        Ok(())
    })
}

/// All entries of a job in append order.
pub fn list(db: &Database, job_id: &str) -> Result<Vec<LogRow>, DatabaseError> {
    list_since(db, job_id, 0)
}

/// Entries with `seq >= offset`, in append order.
pub fn list_since(db: &Database, job_id: &str, offset: u64) -> Result<Vec<LogRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT job_id, seq, timestamp, message FROM job_logs
             WHERE job_id = ?1 AND seq >= ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id, offset], LogRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
