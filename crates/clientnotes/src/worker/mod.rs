pub mod job;
pub mod pool;

pub use job::{Artifact, Counters, DateRange, Job, JobId, JobKind, JobRequest, LogEntry, SYSTEM_OWNER};
pub use pool::{JobQueue, WorkerPool};

// Re-export crossbeam_channel for subscribers in the daemon
pub use crossbeam_channel;
