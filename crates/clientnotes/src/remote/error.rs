use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Stale element handle: {0}")]
    StaleHandle(String),

    #[error("Element not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote dropped our authenticated session.
    #[error("Remote session lost: {0}")]
    SessionLost(String),

    #[error("Credentials rejected: {0}")]
    Rejected(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Target already closed")]
    Closed,
}

impl RemoteError {
    /// Whether retrying the same operation can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Timeout(_)
                | RemoteError::StaleHandle(_)
                | RemoteError::NotFound(_)
                | RemoteError::Transport(_)
                | RemoteError::SessionLost(_)
        )
    }
}
