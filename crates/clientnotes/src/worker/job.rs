use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broadcast::job_progress::JobStatus;
use crate::error::WorkerError;

/// Owner recorded for jobs submitted by the schedule trigger.
pub const SYSTEM_OWNER: &str = "system";

/// Opaque job identifier, assigned at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Manual,
    ScheduledWeekly,
    ScheduledMonthly,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Manual => "manual",
            JobKind::ScheduledWeekly => "scheduled_weekly",
            JobKind::ScheduledMonthly => "scheduled_monthly",
        }
    }

    /// Number of days covered by a scheduled run, ending today.
    pub fn lookback_days(&self) -> Option<i64> {
        match self {
            JobKind::Manual => None,
            JobKind::ScheduledWeekly => Some(7),
            JobKind::ScheduledMonthly => Some(30),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(JobKind::Manual),
            "scheduled_weekly" => Ok(JobKind::ScheduledWeekly),
            "scheduled_monthly" => Ok(JobKind::ScheduledMonthly),
            other => Err(WorkerError::InvalidRequest(format!(
                "unknown job kind '{}'",
                other
            ))),
        }
    }
}

/// Inclusive calendar date range. Always `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, WorkerError> {
        if start > end {
            return Err(WorkerError::InvalidRequest(format!(
                "date range start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Parses ISO `YYYY-MM-DD` dates.
    pub fn parse(start: &str, end: &str) -> Result<Self, WorkerError> {
        let parse = |s: &str| {
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| {
                WorkerError::InvalidRequest(format!("invalid date '{}': {}", s, e))
            })
        };
        Self::new(parse(start)?, parse(end)?)
    }

    /// The `days` days leading up to and including `today`.
    pub fn trailing(today: NaiveDate, days: i64) -> Self {
        Self {
            start: today - Duration::days(days),
            end: today,
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }
}

impl<'de> Deserialize<'de> for DateRange {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            start: NaiveDate,
            end: NaiveDate,
        }

        let raw = Raw::deserialize(deserializer)?;
        DateRange::new(raw.start, raw.end).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

/// Submission payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub kind: JobKind,
    pub date_range: DateRange,
    /// `0` processes every discovered record.
    #[serde(default)]
    pub client_limit: u32,
    pub owner: String,
}

impl JobRequest {
    pub fn manual(date_range: DateRange, client_limit: u32, owner: &str) -> Self {
        Self {
            kind: JobKind::Manual,
            date_range,
            client_limit,
            owner: owner.to_string(),
        }
    }

    /// A scheduled run; the range is derived from `today`.
    pub fn scheduled(kind: JobKind, today: NaiveDate) -> Result<Self, WorkerError> {
        let days = kind.lookback_days().ok_or_else(|| {
            WorkerError::InvalidRequest(format!("{} is not a scheduled kind", kind))
        })?;
        Ok(Self {
            kind,
            date_range: DateRange::trailing(today, days),
            client_limit: 0,
            owner: SYSTEM_OWNER.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.owner.trim().is_empty() {
            return Err(WorkerError::InvalidRequest("owner must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub total: u32,
    pub processed: u32,
    pub failed: u32,
}

impl Counters {
    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.processed + self.failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the job's log, starting at 0.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// A unit of work and its full history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub date_range: DateRange,
    pub client_limit: u32,
    pub owner: String,
    pub status: JobStatus,
    pub counters: Counters,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A freshly queued job for the given request.
    pub fn queued(request: &JobRequest) -> Self {
        Self {
            id: JobId::new(),
            kind: request.kind,
            date_range: request.date_range,
            client_limit: request.client_limit,
            owner: request.owner.clone(),
            status: JobStatus::Queued,
            counters: Counters::default(),
            logs: Vec::new(),
            artifact: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
