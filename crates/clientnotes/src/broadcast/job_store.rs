//! Job store: the single source of truth for job state, with write-through
//! persistence and per-job subscriptions.
//!
//! Each job sits behind its own mutex. A mutation, its write-through and
//! the delivery of the events it produces all happen under that job's lock,
//! so readers never see a torn field group and subscribers see each event
//! exactly once, in order. The map lock is held only to find or add a job,
//! so one job's disk writes never stall another job's workers or pollers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, NaiveDate, Utc};
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::broadcast::job_progress::{JobProgressBroadcaster, JobProgressEvent, JobStatus};
use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::log_repo::{self, LogRow};
use crate::db::{Database, DatabaseError};
use crate::worker::job::{Artifact, Counters, DateRange, Job, JobId, JobKind, JobRequest, LogEntry};

/// Error recorded on jobs that were mid-flight when the process stopped.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

/// Finished jobs reloaded into memory on start-up.
const RESTORE_HISTORY_LIMIT: u64 = 200;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {id}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {0} is finished and can no longer change")]
    Terminal(JobId),

    #[error("Job {id}: processed + failed would exceed total {total}")]
    CounterOverflow { id: JobId, total: u32 },

    #[error("Job {id}: total can only be set while converting (status {status:?})")]
    TotalLocked { id: JobId, status: JobStatus },

    #[error("Job {id} has not completed (status {status:?})")]
    NotCompleted { id: JobId, status: JobStatus },

    #[error("Artifact for job {id} is missing at '{path}'")]
    ArtifactMissing { id: JobId, path: PathBuf },

    #[error("Job {id} is still running (status {status:?})")]
    NotTerminal { id: JobId, status: JobStatus },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Status poll response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub id: JobId,
    pub status: JobStatus,
    pub counters: Counters,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            counters: job.counters,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error_message: job.error_message.clone(),
            artifact: job.artifact.clone(),
        }
    }
}

/// Live view of one job: its state at subscription time plus every event
/// after it. The receiver disconnects after the terminal event.
pub struct JobSubscription {
    pub snapshot: Job,
    pub receiver: Receiver<JobProgressEvent>,
}

struct Entry {
    job: Job,
    subscribers: Vec<Sender<JobProgressEvent>>,
}

impl Entry {
    fn new(job: Job) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            job,
            subscribers: Vec::new(),
        }))
    }
}

type Jobs = HashMap<JobId, Arc<Mutex<Entry>>>;

pub struct JobStore {
    /// Database handle (clone is cheap, inner `Arc`).
    db: RwLock<Option<Database>>,
    jobs: RwLock<Jobs>,
    feed: JobProgressBroadcaster,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            db: RwLock::new(None),
            jobs: RwLock::new(HashMap::new()),
            feed: JobProgressBroadcaster::default(),
        }
    }

    /// Sets the database connection. Later mutations are written through.
    pub fn set_database(&self, db: Database) {
        let mut guard = match self.db.write() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Job store DB lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        *guard = Some(db);
    }

    pub fn get_database(&self) -> Option<Database> {
        let guard = match self.db.read() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Job store DB lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        guard.clone()
    }

    /// Lossy feed of every event from every job.
    pub fn feed(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.feed.subscribe()
    }

    /// Records a new job in `queued` status.
    pub fn insert(&self, request: &JobRequest) -> Job {
        let job = Job::queued(request);
        let event = JobProgressEvent::status(job.id, JobStatus::Queued);

        let entry = Entry::new(job.clone());
        let guard = lock_entry(&entry);
        self.write_jobs().insert(job.id, Arc::clone(&entry));
        self.persist(&job, &[]);
        self.feed.send(event);
        drop(guard);

        log::info!(
            "Job {} queued ({}, {}, limit {}, owner {})",
            job.id,
            job.kind,
            job.date_range,
            job.client_limit,
            job.owner
        );
        job
    }

    /// Moves a job along its success path. Terminal statuses are reached
    /// through `complete` and `fail` only.
    pub fn transition(&self, id: JobId, to: JobStatus) -> Result<(), StoreError> {
        self.mutate(id, |job| {
            if to.is_terminal() || !job.status.can_transition_to(to) {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: job.status,
                    to,
                });
            }
            job.status = to;
            if to == JobStatus::Authenticating {
                job.started_at = Some(Utc::now());
            }
            Ok(vec![JobProgressEvent::status(id, to)])
        })
    }

    /// Fixes `counters.total`. Only allowed while converting.
    pub fn set_total(&self, id: JobId, total: u32) -> Result<(), StoreError> {
        self.mutate(id, |job| {
            if job.status != JobStatus::Converting {
                return Err(StoreError::TotalLocked {
                    id,
                    status: job.status,
                });
            }
            job.counters = Counters {
                total,
                processed: 0,
                failed: 0,
            };
            Ok(vec![JobProgressEvent::counters(id, job.counters)])
        })
    }

    /// Counts one enriched record and logs `message` with it.
    pub fn record_processed(&self, id: JobId, message: &str) -> Result<(), StoreError> {
        self.record_outcome(id, message, |counters| counters.processed += 1)
    }

    /// Counts one failed record and logs `message` with it.
    pub fn record_failed(&self, id: JobId, message: &str) -> Result<(), StoreError> {
        self.record_outcome(id, message, |counters| counters.failed += 1)
    }

    fn record_outcome(
        &self,
        id: JobId,
        message: &str,
        bump: impl FnOnce(&mut Counters),
    ) -> Result<(), StoreError> {
        self.mutate(id, |job| {
            if job.counters.remaining() == 0 {
                return Err(StoreError::CounterOverflow {
                    id,
                    total: job.counters.total,
                });
            }
            bump(&mut job.counters);
            let entry = push_log(job, message);
            Ok(vec![
                JobProgressEvent::counters(id, job.counters),
                JobProgressEvent::log(id, entry),
            ])
        })
    }

    pub fn append_log(&self, id: JobId, message: &str) -> Result<LogEntry, StoreError> {
        let mut appended = None;
        self.mutate(id, |job| {
            let entry = push_log(job, message);
            appended = Some(entry.clone());
            Ok(vec![JobProgressEvent::log(id, entry)])
        })?;
        appended.ok_or(StoreError::NotFound(id))
    }

    /// Records the artifact and completes the job.
    pub fn complete(&self, id: JobId, artifact: Artifact) -> Result<(), StoreError> {
        self.mutate(id, |job| {
            if !job.status.can_transition_to(JobStatus::Completed) {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: job.status,
                    to: JobStatus::Completed,
                });
            }
            job.status = JobStatus::Completed;
            job.artifact = Some(artifact.clone());
            job.completed_at = Some(Utc::now());
            Ok(vec![JobProgressEvent::completed(id, artifact)])
        })?;
        log::info!("Job {} completed", id);
        Ok(())
    }

    /// Fails the job from any non-terminal status.
    pub fn fail(&self, id: JobId, error: &str) -> Result<(), StoreError> {
        self.mutate(id, |job| {
            let entry = push_log(job, &format!("Job failed: {}", error));
            job.status = JobStatus::Failed;
            job.error_message = Some(error.to_string());
            job.completed_at = Some(Utc::now());
            Ok(vec![
                JobProgressEvent::log(id, entry),
                JobProgressEvent::failed(id, error),
            ])
        })?;
        log::warn!("Job {} failed: {}", id, error);
        Ok(())
    }

    /// Applies `change` to a live job, then persists and delivers the
    /// resulting events, all under the job's lock.
    fn mutate<F>(&self, id: JobId, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Job) -> Result<Vec<JobProgressEvent>, StoreError>,
    {
        let entry = self.entry(id).ok_or(StoreError::NotFound(id))?;
        let mut entry = lock_entry(&entry);
        if entry.job.is_finished() {
            return Err(StoreError::Terminal(id));
        }

        let logs_before = entry.job.logs.len();
        let events = change(&mut entry.job)?;
        self.persist(&entry.job, &entry.job.logs[logs_before..]);

        for event in events {
            let terminal = event.is_terminal();
            entry
                .subscribers
                .retain(|subscriber| subscriber.send(event.clone()).is_ok());
            self.feed.send(event);
            if terminal {
                // Dropping the senders disconnects every subscriber.
                entry.subscribers.clear();
            }
        }
        Ok(())
    }

    /// Snapshot plus a channel of every later event for the job.
    pub fn subscribe(&self, id: JobId) -> Result<JobSubscription, StoreError> {
        let entry = self.entry(id).ok_or(StoreError::NotFound(id))?;
        let mut entry = lock_entry(&entry);

        let (sender, receiver) = crossbeam_channel::unbounded();
        if !entry.job.is_finished() {
            entry.subscribers.push(sender);
        }

        Ok(JobSubscription {
            snapshot: entry.job.clone(),
            receiver,
        })
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.entry(id).map(|entry| lock_entry(&entry).job.clone())
    }

    pub fn get_status(&self, id: JobId) -> Option<JobStatusView> {
        self.entry(id)
            .map(|entry| JobStatusView::from(&lock_entry(&entry).job))
    }

    pub fn get_logs(&self, id: JobId) -> Option<Vec<LogEntry>> {
        self.logs_since(id, 0)
    }

    /// Log entries with `seq >= offset`, for poll consumers that remember
    /// how far they have read.
    pub fn logs_since(&self, id: JobId, offset: u64) -> Option<Vec<LogEntry>> {
        self.entry(id).map(|entry| {
            let entry = lock_entry(&entry);
            let start = usize::try_from(offset)
                .unwrap_or(usize::MAX)
                .min(entry.job.logs.len());
            entry.job.logs[start..].to_vec()
        })
    }

    /// All known jobs, newest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .entries()
            .iter()
            .map(|entry| lock_entry(entry).job.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Number of jobs in each status.
    pub fn counts(&self) -> HashMap<JobStatus, usize> {
        let mut counts = HashMap::new();
        for entry in self.entries() {
            *counts.entry(lock_entry(&entry).job.status).or_insert(0) += 1;
        }
        counts
    }

    /// Path of a completed job's artifact, if the file still exists.
    pub fn artifact_path(&self, id: JobId) -> Result<PathBuf, StoreError> {
        let job = self.get(id).ok_or(StoreError::NotFound(id))?;
        let artifact = match (&job.status, &job.artifact) {
            (JobStatus::Completed, Some(artifact)) => artifact,
            _ => {
                return Err(StoreError::NotCompleted {
                    id,
                    status: job.status,
                })
            }
        };
        if !artifact.path.is_file() {
            return Err(StoreError::ArtifactMissing {
                id,
                path: artifact.path.clone(),
            });
        }
        Ok(artifact.path.clone())
    }

    /// Removes a finished job's record and logs. Running jobs cannot be
    /// deleted.
    pub fn delete(&self, id: JobId) -> Result<(), StoreError> {
        let mut jobs = self.write_jobs();
        let entry = Arc::clone(jobs.get(&id).ok_or(StoreError::NotFound(id))?);
        let entry = lock_entry(&entry);
        if !entry.job.is_finished() {
            return Err(StoreError::NotTerminal {
                id,
                status: entry.job.status,
            });
        }

        if let Some(db) = self.get_database() {
            job_repo::delete(&db, &id.to_string())?;
        }
        jobs.remove(&id);
        log::info!("Deleted job {}", id);
        Ok(())
    }

    /// Reloads job history from the database.
    ///
    /// Jobs that were mid-pipeline are failed with `INTERRUPTED_MESSAGE`.
    /// Returns the ids of jobs that were still queued, oldest first, so the
    /// caller can hand them to the worker pool again.
    ///
    /// Only the process that owns the database may call this. Another
    /// process attached to the same file just writes its own jobs through.
    pub fn restore_from_database(&self) -> Result<Vec<JobId>, StoreError> {
        let Some(db) = self.get_database() else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<JobRow> = Vec::new();
        for status in [
            JobStatus::Queued,
            JobStatus::Authenticating,
            JobStatus::Exporting,
            JobStatus::Converting,
            JobStatus::Enriching,
            JobStatus::Generating,
        ] {
            let (found, _) = job_repo::query(
                &db,
                &JobFilter {
                    status: Some(status.as_str().to_string()),
                    limit: Some(u64::from(u32::MAX)),
                    ..Default::default()
                },
            )?;
            rows.extend(found);
        }
        let (recent, _) = job_repo::query(
            &db,
            &JobFilter {
                limit: Some(RESTORE_HISTORY_LIMIT),
                ..Default::default()
            },
        )?;
        rows.extend(recent);

        let mut jobs = self.write_jobs();
        let mut queued = Vec::new();
        let mut interrupted = 0usize;
        let mut loaded = 0usize;

        for row in rows {
            let logs = log_repo::list(&db, &row.id)?;
            let mut job = match job_from_row(&row, &logs) {
                Ok(job) => job,
                Err(e) => {
                    log::warn!("Skipping unreadable job row: {}", e);
                    continue;
                }
            };
            if jobs.contains_key(&job.id) {
                continue;
            }

            if job.status == JobStatus::Queued {
                queued.push((job.created_at, job.id));
            } else if job.status.is_active() {
                let logs_before = job.logs.len();
                push_log(&mut job, &format!("Job failed: {}", INTERRUPTED_MESSAGE));
                job.status = JobStatus::Failed;
                job.error_message = Some(INTERRUPTED_MESSAGE.to_string());
                job.completed_at = Some(Utc::now());
                self.persist(&job, &job.logs[logs_before..]);
                interrupted += 1;
            }

            jobs.insert(job.id, Entry::new(job));
            loaded += 1;
        }

        queued.sort();
        log::info!(
            "Restored {} jobs from database ({} queued, {} interrupted)",
            loaded,
            queued.len(),
            interrupted
        );
        Ok(queued.into_iter().map(|(_, id)| id).collect())
    }

    fn persist(&self, job: &Job, new_logs: &[LogEntry]) {
        let Some(db) = self.get_database() else {
            return;
        };

        if let Err(e) = job_repo::upsert(&db, &job_to_row(job)) {
            log::error!("Failed to persist job {}: {}", job.id, e);
            return;
        }
        for entry in new_logs {
            let row = LogRow {
                job_id: job.id.to_string(),
                seq: entry.seq,
                timestamp: entry.timestamp.to_rfc3339(),
                message: entry.message.clone(),
            };
            if let Err(e) = log_repo::append(&db, &row) {
                log::error!("Failed to persist log entry {} of job {}: {}", entry.seq, job.id, e);
            }
        }
    }

    fn entry(&self, id: JobId) -> Option<Arc<Mutex<Entry>>> {
        self.read_jobs().get(&id).cloned()
    }

    fn entries(&self) -> Vec<Arc<Mutex<Entry>>> {
        self.read_jobs().values().cloned().collect()
    }

    fn read_jobs(&self) -> RwLockReadGuard<'_, Jobs> {
        match self.jobs.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, Jobs> {
        match self.jobs.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

fn lock_entry(entry: &Mutex<Entry>) -> MutexGuard<'_, Entry> {
    match entry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Job entry lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn push_log(job: &mut Job, message: &str) -> LogEntry {
    let entry = LogEntry {
        seq: job.logs.len() as u64,
        timestamp: Utc::now(),
        message: message.to_string(),
    };
    job.logs.push(entry.clone());
    entry
}

// ─── Row conversion ─────────────────────────────────────────────────────────

fn job_to_row(job: &Job) -> JobRow {
    JobRow {
        id: job.id.to_string(),
        kind: job.kind.as_str().to_string(),
        range_start: job.date_range.start().to_string(),
        range_end: job.date_range.end().to_string(),
        client_limit: job.client_limit,
        owner: job.owner.clone(),
        status: job.status.as_str().to_string(),
        total: job.counters.total,
        processed: job.counters.processed,
        failed: job.counters.failed,
        artifact_path: job
            .artifact
            .as_ref()
            .map(|a| a.path.to_string_lossy().into_owned()),
        artifact_size: job.artifact.as_ref().map(|a| a.size_bytes),
        error_message: job.error_message.clone(),
        created_at: job.created_at.to_rfc3339(),
        started_at: job.started_at.map(|t| t.to_rfc3339()),
        completed_at: job.completed_at.map(|t| t.to_rfc3339()),
        updated_at: Utc::now().to_rfc3339(),
    }
}

fn job_from_row(row: &JobRow, logs: &[LogRow]) -> Result<Job, DatabaseError> {
    let corrupt = |reason: String| DatabaseError::CorruptRow {
        table: "jobs",
        id: row.id.clone(),
        reason,
    };
    let timestamp = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| corrupt(format!("bad timestamp '{}': {}", s, e)))
    };
    let date = |s: &str| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| corrupt(format!("bad date '{}': {}", s, e)))
    };

    let id = row
        .id
        .parse::<JobId>()
        .map_err(|e| corrupt(format!("bad id: {}", e)))?;
    let kind = row
        .kind
        .parse::<JobKind>()
        .map_err(|e| corrupt(e.to_string()))?;
    let status = JobStatus::parse(&row.status)
        .ok_or_else(|| corrupt(format!("unknown status '{}'", row.status)))?;
    let date_range = DateRange::new(date(&row.range_start)?, date(&row.range_end)?)
        .map_err(|e| corrupt(e.to_string()))?;

    let artifact = match (&row.artifact_path, row.artifact_size) {
        (Some(path), Some(size_bytes)) => Some(Artifact {
            path: PathBuf::from(path),
            size_bytes,
        }),
        _ => None,
    };

    let logs = logs
        .iter()
        .map(|log| {
            Ok(LogEntry {
                seq: log.seq,
                timestamp: timestamp(&log.timestamp)?,
                message: log.message.clone(),
            })
        })
        .collect::<Result<Vec<_>, DatabaseError>>()?;

    Ok(Job {
        id,
        kind,
        date_range,
        client_limit: row.client_limit,
        owner: row.owner.clone(),
        status,
        counters: Counters {
            total: row.total,
            processed: row.processed,
            failed: row.failed,
        },
        logs,
        artifact,
        error_message: row.error_message.clone(),
        created_at: timestamp(&row.created_at)?,
        started_at: row.started_at.as_deref().map(timestamp).transpose()?,
        completed_at: row.completed_at.as_deref().map(timestamp).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broadcast::job_progress::JobUpdate;

    fn request() -> JobRequest {
        JobRequest::manual(
            DateRange::parse("2024-01-01", "2024-01-07").unwrap(),
            0,
            "alice",
        )
    }

    /// Walks a fresh job up to `Enriching` with the given total.
    fn enriching_job(store: &JobStore, total: u32) -> JobId {
        let id = store.insert(&request()).id;
        store.transition(id, JobStatus::Authenticating).unwrap();
        store.transition(id, JobStatus::Exporting).unwrap();
        store.transition(id, JobStatus::Converting).unwrap();
        store.set_total(id, total).unwrap();
        store.transition(id, JobStatus::Enriching).unwrap();
        id
    }

    #[test]
    fn test_insert_is_queued() {
        let store = JobStore::new();
        let job = store.insert(&request());

        let status = store.get_status(job.id).unwrap();
        assert_eq!(status.status, JobStatus::Queued);
        assert!(status.started_at.is_none());
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let store = JobStore::new();
        let id = store.insert(&request()).id;

        assert!(matches!(
            store.transition(id, JobStatus::Exporting),
            Err(StoreError::InvalidTransition { .. })
        ));
        store.transition(id, JobStatus::Authenticating).unwrap();
        assert!(store.get(id).unwrap().started_at.is_some());

        assert!(matches!(
            store.transition(id, JobStatus::Queued),
            Err(StoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.transition(id, JobStatus::Completed),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_total_only_while_converting() {
        let store = JobStore::new();
        let id = enriching_job(&store, 3);

        assert!(matches!(
            store.set_total(id, 10),
            Err(StoreError::TotalLocked { .. })
        ));
        assert_eq!(store.get(id).unwrap().counters.total, 3);
    }

    #[test]
    fn test_counters_never_exceed_total() {
        let store = JobStore::new();
        let id = enriching_job(&store, 2);

        store.record_processed(id, "[1/2] Successfully processed Hopper, Grace").unwrap();
        store.record_failed(id, "[2/2] Failed to process Lovelace, Ada: timeout").unwrap();
        assert!(matches!(
            store.record_processed(id, "extra"),
            Err(StoreError::CounterOverflow { total: 2, .. })
        ));

        let job = store.get(id).unwrap();
        assert_eq!(
            job.counters,
            Counters {
                total: 2,
                processed: 1,
                failed: 1
            }
        );
        assert_eq!(job.logs.len(), 2);
        assert_eq!(job.logs[1].seq, 1);
    }

    #[test]
    fn test_terminal_jobs_are_immutable() {
        let store = JobStore::new();
        let id = store.insert(&request()).id;
        store.fail(id, "authentication failed: timeout").unwrap();

        assert!(matches!(store.append_log(id, "late"), Err(StoreError::Terminal(_))));
        assert!(matches!(store.fail(id, "again"), Err(StoreError::Terminal(_))));

        let job = store.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("authentication failed: timeout"));
        assert!(job.completed_at.is_some());
        assert!(job.artifact.is_none());
    }

    #[test]
    fn test_subscription_sees_later_events_once_in_order() {
        let store = JobStore::new();
        let id = enriching_job(&store, 2);
        store.append_log(id, "before subscribe").unwrap();

        let sub = store.subscribe(id).unwrap();
        assert_eq!(sub.snapshot.logs.len(), 1);

        store.record_processed(id, "one").unwrap();
        store.record_processed(id, "two").unwrap();
        store.transition(id, JobStatus::Generating).unwrap();
        store
            .complete(
                id,
                Artifact {
                    path: PathBuf::from("/out/a.xlsx"),
                    size_bytes: 10,
                },
            )
            .unwrap();

        let events: Vec<JobProgressEvent> = sub.receiver.iter().collect();
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match &e.update {
                JobUpdate::Status { .. } => "status",
                JobUpdate::Counters { .. } => "counters",
                JobUpdate::Log { .. } => "log",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["counters", "log", "counters", "log", "status", "status"]
        );
        assert!(events.last().unwrap().is_terminal());

        let seqs: Vec<u64> = events
            .iter()
            .filter_map(|e| match &e.update {
                JobUpdate::Log { entry } => Some(entry.seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_subscribe_to_finished_job_is_closed() {
        let store = JobStore::new();
        let id = store.insert(&request()).id;
        store.fail(id, "boom").unwrap();

        let sub = store.subscribe(id).unwrap();
        assert_eq!(sub.snapshot.status, JobStatus::Failed);
        assert!(sub.receiver.recv().is_err());
    }

    #[test]
    fn test_logs_since() {
        let store = JobStore::new();
        let id = store.insert(&request()).id;
        for i in 0..5 {
            store.append_log(id, &format!("line {}", i)).unwrap();
        }

        let tail = store.logs_since(id, 3).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "line 3");
        assert!(store.logs_since(id, 99).unwrap().is_empty());
        assert!(store.logs_since(JobId::new(), 0).is_none());
    }

    #[test]
    fn test_artifact_path_requires_completed_and_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JobStore::new();
        let id = enriching_job(&store, 0);

        assert!(matches!(
            store.artifact_path(id),
            Err(StoreError::NotCompleted { .. })
        ));

        let path = dir.path().join("out.xlsx");
        store.transition(id, JobStatus::Generating).unwrap();
        store
            .complete(
                id,
                Artifact {
                    path: path.clone(),
                    size_bytes: 3,
                },
            )
            .unwrap();
        assert!(matches!(
            store.artifact_path(id),
            Err(StoreError::ArtifactMissing { .. })
        ));

        std::fs::write(&path, b"xyz").unwrap();
        assert_eq!(store.artifact_path(id).unwrap(), path);
    }

    #[test]
    fn test_delete_only_finished_jobs() {
        let store = JobStore::new();
        let id = store.insert(&request()).id;

        assert!(matches!(store.delete(id), Err(StoreError::NotTerminal { .. })));
        store.fail(id, "boom").unwrap();
        store.delete(id).unwrap();
        assert!(store.get(id).is_none());
        assert!(matches!(store.delete(id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_write_through_and_restore() {
        let db = Database::open_in_memory().unwrap();

        let store = JobStore::new();
        store.set_database(db.clone());
        let queued = store.insert(&request()).id;
        let running = enriching_job(&store, 4);
        store.record_processed(running, "[1/4] Successfully processed Hopper, Grace").unwrap();
        let done = store.insert(&request()).id;
        store.fail(done, "export failed: timeout").unwrap();

        let restored = JobStore::new();
        restored.set_database(db.clone());
        let requeue = restored.restore_from_database().unwrap();

        assert_eq!(requeue, vec![queued]);
        assert_eq!(restored.list().len(), 3);

        let job = restored.get(running).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert_eq!(job.counters.processed, 1);
        assert_eq!(job.logs.len(), 2);
        assert_eq!(job.logs[0].message, "[1/4] Successfully processed Hopper, Grace");

        let row = job_repo::find_by_id(&db, &running.to_string()).unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(log_repo::list(&db, &running.to_string()).unwrap().len(), 2);
    }

    #[test]
    fn test_delete_removes_persisted_rows() {
        let db = Database::open_in_memory().unwrap();
        let store = JobStore::new();
        store.set_database(db.clone());

        let id = store.insert(&request()).id;
        store.fail(id, "boom").unwrap();
        store.delete(id).unwrap();

        assert!(job_repo::find_by_id(&db, &id.to_string()).unwrap().is_none());
        assert!(log_repo::list(&db, &id.to_string()).unwrap().is_empty());
    }

    #[test]
    fn test_slow_write_does_not_block_other_jobs() {
        let db = Database::open_in_memory().unwrap();
        let store = Arc::new(JobStore::new());
        store.set_database(db.clone());
        let busy = store.insert(&request()).id;
        let idle = store.insert(&request()).id;

        // Hold the connection so the next write-through blocks.
        let (held_tx, held_rx) = crossbeam_channel::bounded(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let held = db.clone();
        let holder = std::thread::spawn(move || {
            held.with_conn(|_| {
                held_tx.send(()).ok();
                release_rx.recv().ok();
                Ok(())
            })
            .unwrap();
        });
        held_rx.recv().unwrap();

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || store.append_log(busy, "waiting on disk").unwrap())
        };
        std::thread::sleep(Duration::from_millis(100));

        let (status_tx, status_rx) = crossbeam_channel::bounded(1);
        let reader = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                status_tx.send(store.get_status(idle).map(|s| s.status)).ok();
            })
        };
        let status = status_rx.recv_timeout(Duration::from_secs(2));
        assert_eq!(status.ok().flatten(), Some(JobStatus::Queued));
        assert!(!writer.is_finished());

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(store.get_logs(busy).unwrap().len(), 1);
        assert_eq!(log_repo::list(&db, &busy.to_string()).unwrap().len(), 1);
    }

    #[test]
    fn test_feed_mirrors_events() {
        let store = JobStore::new();
        let mut feed = store.feed();
        let id = store.insert(&request()).id;
        store.append_log(id, "hello").unwrap();

        let first = feed.try_recv().unwrap();
        assert_eq!(first.job_id, id);
        assert!(matches!(first.update, JobUpdate::Status { status: JobStatus::Queued, .. }));
        assert!(matches!(feed.try_recv().unwrap().update, JobUpdate::Log { .. }));
    }
}
