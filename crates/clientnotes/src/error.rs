use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientNotesError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("Job store error: {0}")]
    Store(#[from] crate::broadcast::StoreError),

    #[error("Remote error: {0}")]
    Remote(#[from] crate::remote::RemoteError),

    #[error("Logging error: {0}")]
    Telemetry(#[from] crate::telemetry::TelemetryError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid schedule '{name}': {reason}")]
    InvalidSchedule { name: String, reason: String },

    #[error("Invalid retry policy '{name}': {reason}")]
    InvalidRetry { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Invalid job request: {0}")]
    InvalidRequest(String),

    #[error("Failed to record job: {0}")]
    Store(#[from] crate::broadcast::StoreError),
}

pub type Result<T> = std::result::Result<T, ClientNotesError>;
