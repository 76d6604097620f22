pub mod artifact;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod records;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod secrets;
pub mod session;
pub mod telemetry;
pub mod worker;

pub use broadcast::{JobProgressBroadcaster, JobProgressEvent, JobStatus, JobStore, StoreError};
pub use config::{load_config, Config};
pub use db::{Database, DatabaseError};
pub use error::{ClientNotesError, ConfigError, Result, WorkerError};
pub use pipeline::{Pipeline, PipelineConfig, PipelineOutcome};
pub use remote::{RemoteError, RemoteTarget, TargetConnector};
pub use retry::{Backoff, RetryError, RetryPolicy};
pub use scheduler::{Cadence, ScheduleTrigger};
pub use secrets::{resolve_secret, Credentials, SecretError};
pub use session::{RemoteSession, SessionError};
pub use worker::{JobQueue, WorkerPool};
