use std::time::Duration;
use thiserror::Error;

/// Error taxonomy for the session engine. Handlers map these onto HTTP
/// status codes; the live data path recovers locally and only surfaces
/// errors once retries are exhausted.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The project already holds the configured maximum number of sessions.
    #[error("project '{0}' is at its session limit")]
    ResourceExhausted(String),

    /// The project's focus set is at capacity; the caller must unfocus
    /// another session first. Never triggers implicit eviction.
    #[error("focus set for project '{0}' is at capacity")]
    FocusLimitExceeded(String),

    /// Unknown session id, reported after the attach retry loop is spent.
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// The process did not come up within the spawn timeout.
    #[error("process spawn timed out after {0:?}")]
    SpawnTimeout(Duration),

    /// Circuit open: the persistence backend is degraded. Never fatal to
    /// live operation.
    #[error("persistence backend unavailable")]
    BackendUnavailable,

    #[error("pty error: {0}")]
    Pty(#[from] pty_session::PtyError),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn internal(msg: impl Into<String>) -> Self {
        EngineError::Internal(msg.into())
    }
}
