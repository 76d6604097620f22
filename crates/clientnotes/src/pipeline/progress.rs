use std::sync::Arc;

use crate::broadcast::job_progress::JobStatus;
use crate::broadcast::job_store::{JobStore, StoreError};
use crate::worker::job::{Artifact, JobId};

/// Events emitted by the pipeline while it runs a job.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Phase(JobStatus),
    /// Number of records the enrichment loop will visit.
    Total(u32),
    RecordProcessed {
        message: String,
    },
    RecordFailed {
        message: String,
    },
    Log {
        message: String,
    },
    Completed {
        artifact: Artifact,
    },
    Failed {
        error: String,
    },
}

impl ProgressEvent {
    pub fn log(message: impl Into<String>) -> Self {
        ProgressEvent::Log {
            message: message.into(),
        }
    }
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Applies pipeline events to one job in the store.
pub struct StoreProgress {
    store: Arc<JobStore>,
    job_id: JobId,
}

impl StoreProgress {
    pub fn new(store: Arc<JobStore>, job_id: JobId) -> Self {
        Self { store, job_id }
    }

    fn apply(&self, event: ProgressEvent) -> Result<(), StoreError> {
        let id = self.job_id;
        match event {
            ProgressEvent::Phase(status) => self.store.transition(id, status),
            ProgressEvent::Total(total) => self.store.set_total(id, total),
            ProgressEvent::RecordProcessed { message } => {
                self.store.record_processed(id, &message)
            }
            ProgressEvent::RecordFailed { message } => self.store.record_failed(id, &message),
            ProgressEvent::Log { message } => self.store.append_log(id, &message).map(|_| ()),
            ProgressEvent::Completed { artifact } => self.store.complete(id, artifact),
            ProgressEvent::Failed { error } => self.store.fail(id, &error),
        }
    }
}

impl ProgressReporter for StoreProgress {
    fn report(&self, event: ProgressEvent) {
        if let Err(e) = self.apply(event) {
            log::error!("Failed to record progress for job {}: {}", self.job_id, e);
        }
    }
}
