//! Process logging setup.
//!
//! Library code logs through the `log` facade and opens `tracing` spans per
//! pipeline stage; both end up in one `tracing-subscriber` registry.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{directive}': {source}")]
    Filter {
        directive: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("Failed to install log subscriber: {0}")]
    Install(String),
}

/// Builds the filter: `RUST_LOG` when set, otherwise the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|source| TelemetryError::Filter {
        directive: config.level.clone(),
        source,
    })
}

/// Installs the global subscriber and bridges `log` records into it.
/// Call once, before any worker starts.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = env_filter(config)?;

    if config.json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(true).with_thread_names(true));
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| TelemetryError::Install(e.to_string()))?;
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_names(true));
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| TelemetryError::Install(e.to_string()))?;
    }

    tracing_log::LogTracer::init().map_err(|e| TelemetryError::Install(e.to_string()))?;

    log::debug!(
        "Logging initialized (level {}, json {})",
        config.level,
        config.json
    );
    Ok(())
}
