//! Job repository: CRUD operations for the `jobs` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub kind: String,
    pub range_start: String,
    pub range_end: String,
    pub client_limit: u32,
    pub owner: String,
    pub status: String,
    pub total: u32,
    pub processed: u32,
    pub failed: u32,
    pub artifact_path: Option<String>,
    pub artifact_size: Option<u64>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            kind: row.get("kind")?,
            range_start: row.get("range_start")?,
            range_end: row.get("range_end")?,
            client_limit: row.get("client_limit")?,
            owner: row.get("owner")?,
            status: row.get("status")?,
            total: row.get("total")?,
            processed: row.get("processed")?,
            failed: row.get("failed")?,
            artifact_path: row.get("artifact_path")?,
            artifact_size: row.get("artifact_size")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<String>,
    pub kind: Option<String>,
    pub owner: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a job, or overwrites every mutable column if it already exists.
pub fn upsert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, kind, range_start, range_end, client_limit, owner, status,
             total, processed, failed, artifact_path, artifact_size, error_message,
             created_at, started_at, completed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                total = excluded.total,
                processed = excluded.processed,
                failed = excluded.failed,
                artifact_path = excluded.artifact_path,
                artifact_size = excluded.artifact_size,
                error_message = excluded.error_message,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at",
            params![
                job.id,
                job.kind,
                job.range_start,
                job.range_end,
                job.client_limit,
                job.owner,
                job.status,
                job.total,
                job.processed,
                job.failed,
                job.artifact_path,
                job.artifact_size,
                job.error_message,
                job.created_at,
                job.started_at,
                job.completed_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Queries jobs with filters, newest first, returning (rows, total_count).
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.clone()));
        }
        if let Some(ref kind) = filter.kind {
            conditions.push(format!("kind = ?{}", param_values.len() + 1));
            param_values.push(Box::new(kind.clone()));
        }
        if let Some(ref owner) = filter.owner {
            conditions.push(format!("owner = ?{}", param_values.len() + 1));
            param_values.push(Box::new(owner.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Counts jobs with the given status.
pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Deletes a job; its log entries go with it. Returns whether a row existed.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let affected = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    pub(crate) fn sample_job(id: &str) -> JobRow {
        JobRow {
            id: id.to_string(),
            kind: "manual".to_string(),
            range_start: "2024-01-01".to_string(),
            range_end: "2024-01-07".to_string(),
            client_limit: 0,
            owner: "alice".to_string(),
            status: "queued".to_string(),
            total: 0,
            processed: 0,
            failed: 0,
            artifact_path: None,
            artifact_size: None,
            error_message: None,
            created_at: "2024-01-08T00:00:00+00:00".to_string(),
            started_at: None,
            completed_at: None,
            updated_at: "2024-01-08T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn test_upsert_and_find() {
        let db = test_db();
        upsert(&db, &sample_job("job-1")).unwrap();

        let found = find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(found, sample_job("job-1"));
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_db();
        assert!(find_by_id(&db, "nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_upsert_overwrites_progress_but_not_identity() {
        let db = test_db();
        let mut job = sample_job("job-2");
        upsert(&db, &job).unwrap();

        job.status = "completed".to_string();
        job.total = 12;
        job.processed = 10;
        job.failed = 2;
        job.artifact_path = Some("/out/job-2/manual.xlsx".to_string());
        job.artifact_size = Some(4096);
        job.completed_at = Some("2024-01-08T01:00:00+00:00".to_string());
        job.owner = "mallory".to_string();
        upsert(&db, &job).unwrap();

        let found = find_by_id(&db, "job-2").unwrap().unwrap();
        assert_eq!(found.status, "completed");
        assert_eq!((found.total, found.processed, found.failed), (12, 10, 2));
        assert_eq!(found.artifact_size, Some(4096));
        assert_eq!(found.owner, "alice");
    }

    #[test]
    fn test_query_with_status_filter() {
        let db = test_db();
        upsert(&db, &sample_job("s1")).unwrap();

        let mut failed = sample_job("s2");
        failed.status = "failed".to_string();
        upsert(&db, &failed).unwrap();

        let (rows, total) = query(
            &db,
            &JobFilter {
                status: Some("failed".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, "s2");
    }

    #[test]
    fn test_query_pagination_newest_first() {
        let db = test_db();
        for i in 0..10 {
            let mut job = sample_job(&format!("p{}", i));
            job.created_at = format!("2024-01-{:02}T00:00:00+00:00", i + 1);
            upsert(&db, &job).unwrap();
        }

        let (rows, total) = query(
            &db,
            &JobFilter {
                limit: Some(3),
                offset: Some(0),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 10);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].id, "p9");
    }

    #[test]
    fn test_count_by_status() {
        let db = test_db();
        upsert(&db, &sample_job("c1")).unwrap();
        upsert(&db, &sample_job("c2")).unwrap();

        assert_eq!(count_by_status(&db, "queued").unwrap(), 2);
        assert_eq!(count_by_status(&db, "failed").unwrap(), 0);
    }

    #[test]
    fn test_delete() {
        let db = test_db();
        upsert(&db, &sample_job("d1")).unwrap();

        assert!(delete(&db, "d1").unwrap());
        assert!(!delete(&db, "d1").unwrap());
        assert!(find_by_id(&db, "d1").unwrap().is_none());
    }
}
