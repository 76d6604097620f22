//! Test harness for isolated job execution.
//!
//! The `TestHarness` owns a temporary output directory, a `JobStore`
//! (optionally backed by a file database) and a `WorkerPool` whose
//! pipeline talks to a `ScriptedConnector`. Retry and re-login backoffs
//! are zero so failure scenarios run instantly.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use clientnotes::broadcast::{JobStatus, JobStore};
use clientnotes::db::Database;
use clientnotes::pipeline::{Pipeline, PipelineConfig};
use clientnotes::remote::{Script, ScriptedConnector};
use clientnotes::retry::{Backoff, RetryPolicy};
use clientnotes::secrets::Credentials;
use clientnotes::session::SessionSettings;
use clientnotes::worker::{DateRange, Job, JobId, JobKind, JobQueue, WorkerPool};

/// How long a scenario may take before the test gives up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(15);

pub struct TestHarness {
    /// Temporary directory holding outputs and the database.
    temp_dir: TempDir,
    /// Where artifacts are written.
    pub output_dir: PathBuf,
    pub store: Arc<JobStore>,
    pub connector: ScriptedConnector,
    pool: Option<WorkerPool>,
}

impl TestHarness {
    /// Harness with one worker and an in-memory store.
    pub fn new(script: Script) -> Self {
        Self::with_workers(script, 1)
    }

    pub fn with_workers(script: Script, worker_count: usize) -> Self {
        let harness = Self::stopped(script);
        harness.start(worker_count)
    }

    /// Harness whose pool has not been started yet, for tests that prepare
    /// the store first.
    pub fn stopped(script: Script) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let output_dir = temp_dir.path().join("output");
        std::fs::create_dir_all(&output_dir).expect("Failed to create output dir");

        Self {
            temp_dir,
            output_dir,
            store: Arc::new(JobStore::new()),
            connector: script.into_connector(),
            pool: None,
        }
    }

    pub fn start(mut self, worker_count: usize) -> Self {
        let pool = WorkerPool::start(self.pipeline(), Arc::clone(&self.store), worker_count)
            .expect("Failed to start worker pool");
        self.pool = Some(pool);
        self
    }

    /// Opens (or reopens) the harness database and attaches it to the store.
    pub fn attach_database(&self) -> Database {
        let db = Database::open(&self.database_path()).expect("Failed to open database");
        self.store.set_database(db.clone());
        db
    }

    pub fn database_path(&self) -> PathBuf {
        self.temp_dir.path().join("data").join("clientnotes.db")
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            output_directory: self.output_dir.clone(),
            session: SessionSettings {
                idle_threshold: Duration::from_secs(300),
                max_relogin_attempts: 3,
                relogin_backoff: Backoff::NONE,
            },
            login_retry: RetryPolicy::new(3, Backoff::NONE),
            export_retry: RetryPolicy::new(3, Backoff::NONE),
            lookup_retry: RetryPolicy::new(3, Backoff::NONE),
        }
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(
            Arc::new(self.pipeline_config()),
            Arc::new(self.connector.clone()),
            Arc::new(Credentials::new("agency-7", "ops@example.com", "hunter2")),
        ))
    }

    pub fn script(&self) -> &Arc<Script> {
        self.connector.script()
    }

    pub fn pool(&self) -> &WorkerPool {
        self.pool.as_ref().expect("worker pool not started")
    }

    pub fn queue(&self) -> JobQueue {
        self.pool().queue()
    }

    /// Submits a manual job for the first week of 2024.
    pub fn submit(&self, client_limit: u32) -> JobId {
        self.queue()
            .submit(JobKind::Manual, first_week(), client_limit, "alice")
            .expect("Failed to submit job")
    }

    /// Blocks until the job is completed or failed and returns it.
    pub fn wait_for_terminal(&self, id: JobId) -> Job {
        wait_until(&format!("job {} to finish", id), || {
            self.store.get(id).map(|j| j.is_finished()).unwrap_or(false)
        });
        self.store.get(id).expect("job vanished")
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.store.counts().get(&status).copied().unwrap_or(0)
    }

    /// Stops the pool and joins every worker.
    pub fn shutdown(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
            pool.wait();
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub fn first_week() -> DateRange {
    DateRange::parse("2024-01-01", "2024-01-07").expect("valid range")
}

/// Polls `cond` until it holds, panicking after the harness timeout.
pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}
