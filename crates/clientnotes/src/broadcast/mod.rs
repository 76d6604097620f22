//! Job state and the events emitted as it changes.
//!
//! `JobStore` holds every job and delivers exact per-job subscriptions;
//! `JobProgressBroadcaster` is the lossy all-jobs feed for dashboards.

pub mod job_progress;
pub mod job_store;

pub use job_progress::{JobProgressBroadcaster, JobProgressEvent, JobStatus, JobUpdate};
pub use job_store::{JobStatusView, JobStore, JobSubscription, StoreError, INTERRUPTED_MESSAGE};
