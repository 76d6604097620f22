//! Job status state machine and the events emitted as a job advances.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::worker::job::{Artifact, Counters, JobId, LogEntry};

/// Pipeline status of a job.
///
/// The success path is strictly ordered; `Failed` is reachable from every
/// non-terminal status. There is no cancelled state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Authenticating,
    Exporting,
    Converting,
    Enriching,
    Generating,
    Completed,
    Failed,
}

impl JobStatus {
    /// Position on the success path. `Failed` has none.
    fn rank(&self) -> Option<u8> {
        match self {
            JobStatus::Queued => Some(0),
            JobStatus::Authenticating => Some(1),
            JobStatus::Exporting => Some(2),
            JobStatus::Converting => Some(3),
            JobStatus::Enriching => Some(4),
            JobStatus::Generating => Some(5),
            JobStatus::Completed => Some(6),
            JobStatus::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the job has been picked up by a worker and is not finished.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != JobStatus::Queued
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == JobStatus::Failed {
            return true;
        }
        match (self.rank(), next.rank()) {
            (Some(current), Some(next)) => next == current + 1,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Authenticating => "authenticating",
            JobStatus::Exporting => "exporting",
            JobStatus::Converting => "converting",
            JobStatus::Enriching => "enriching",
            JobStatus::Generating => "generating",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "authenticating" => Some(JobStatus::Authenticating),
            "exporting" => Some(JobStatus::Exporting),
            "converting" => Some(JobStatus::Converting),
            "enriching" => Some(JobStatus::Enriching),
            "generating" => Some(JobStatus::Generating),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "Queued"),
            JobStatus::Authenticating => write!(f, "Authenticating"),
            JobStatus::Exporting => write!(f, "Exporting dataset"),
            JobStatus::Converting => write!(f, "Converting records"),
            JobStatus::Enriching => write!(f, "Enriching records"),
            JobStatus::Generating => write!(f, "Generating artifact"),
            JobStatus::Completed => write!(f, "Completed"),
            JobStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// What changed on a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobUpdate {
    Status {
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact: Option<Artifact>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Counters {
        counters: Counters,
    },
    Log {
        entry: LogEntry,
    },
}

/// A single change to a job, as delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub update: JobUpdate,
}

impl JobProgressEvent {
    pub fn new(job_id: JobId, update: JobUpdate) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            update,
        }
    }

    pub fn status(job_id: JobId, status: JobStatus) -> Self {
        Self::new(
            job_id,
            JobUpdate::Status {
                status,
                artifact: None,
                error: None,
            },
        )
    }

    pub fn completed(job_id: JobId, artifact: Artifact) -> Self {
        Self::new(
            job_id,
            JobUpdate::Status {
                status: JobStatus::Completed,
                artifact: Some(artifact),
                error: None,
            },
        )
    }

    pub fn failed(job_id: JobId, error: &str) -> Self {
        Self::new(
            job_id,
            JobUpdate::Status {
                status: JobStatus::Failed,
                artifact: None,
                error: Some(error.to_string()),
            },
        )
    }

    pub fn log(job_id: JobId, entry: LogEntry) -> Self {
        Self::new(job_id, JobUpdate::Log { entry })
    }

    pub fn counters(job_id: JobId, counters: Counters) -> Self {
        Self::new(job_id, JobUpdate::Counters { counters })
    }

    /// True for the last event a job will ever emit.
    pub fn is_terminal(&self) -> bool {
        matches!(&self.update, JobUpdate::Status { status, .. } if status.is_terminal())
    }
}

/// Lossy fan-out of every job event, for dashboards.
///
/// Slow receivers may observe `Lagged`; per-job exact delivery goes
/// through `JobStore::subscribe` instead.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobProgressEvent) {
        // Ignore errors - no active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
