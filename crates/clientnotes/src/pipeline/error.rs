use thiserror::Error;

use crate::artifact::ArtifactError;
use crate::records::ConvertError;
use crate::remote::RemoteError;
use crate::retry::RetryError;
use crate::session::SessionError;

/// Why a job failed. The display form is what ends up in the job's
/// `error_message`, so every variant leads with its stage.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("authentication failed: {0}")]
    Authentication(RetryError<RemoteError>),

    #[error("export failed: {0}")]
    Export(RetryError<SessionError>),

    #[error("conversion failed: {0}")]
    Conversion(#[from] ConvertError),

    #[error("session refresh failed: {0}")]
    Refresh(RetryError<SessionError>),

    #[error("remote session lost: {0}")]
    SessionLost(SessionError),

    #[error("artifact generation failed: {0}")]
    Artifact(#[from] ArtifactError),
}

impl PipelineError {
    /// Wraps a retried remote failure for `stage`, unless the session died
    /// underneath it.
    pub(crate) fn remote(
        stage: fn(RetryError<SessionError>) -> PipelineError,
        error: RetryError<SessionError>,
    ) -> Self {
        match error {
            RetryError::Fatal(e @ SessionError::Dead { .. }) => PipelineError::SessionLost(e),
            other => stage(other),
        }
    }
}

impl From<SessionError> for PipelineError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Authentication(e) => PipelineError::Authentication(e),
            other => PipelineError::SessionLost(other),
        }
    }
}
