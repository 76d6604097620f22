use std::path::PathBuf;

use crate::config::Config;
use crate::retry::RetryPolicy;
use crate::session::SessionSettings;

pub struct PipelineConfig {
    pub output_directory: PathBuf,
    pub session: SessionSettings,
    pub login_retry: RetryPolicy,
    pub export_retry: RetryPolicy,
    /// Used for each record lookup and for the pre-enrichment refresh.
    pub lookup_retry: RetryPolicy,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            output_directory: PathBuf::from(&config.output_directory),
            session: SessionSettings::from(&config.session),
            login_retry: config.retry.login,
            export_retry: config.retry.export,
            lookup_retry: config.retry.lookup,
        }
    }
}
