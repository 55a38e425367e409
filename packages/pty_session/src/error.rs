use std::fmt;

/// Errors from PTY operations
#[derive(Debug)]
pub enum PtyError {
    /// Could not open the PTY pair or spawn the command
    SpawnFailed(String),
    /// Writing input to the process failed
    WriteFailed(String),
    /// Resizing the terminal failed
    ResizeFailed(String),
    /// Delivering a signal to the process failed
    SignalFailed(String),
    /// The process has already exited
    ProcessExited,
    /// The actor is gone or did not respond
    ChannelClosed(String),
}

impl fmt::Display for PtyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PtyError::SpawnFailed(msg) => write!(f, "failed to spawn PTY process: {}", msg),
            PtyError::WriteFailed(msg) => write!(f, "failed to write to PTY: {}", msg),
            PtyError::ResizeFailed(msg) => write!(f, "failed to resize PTY: {}", msg),
            PtyError::SignalFailed(msg) => write!(f, "failed to signal PTY process: {}", msg),
            PtyError::ProcessExited => write!(f, "PTY process has exited"),
            PtyError::ChannelClosed(msg) => write!(f, "PTY actor unavailable: {}", msg),
        }
    }
}

impl std::error::Error for PtyError {}

impl From<anyhow::Error> for PtyError {
    fn from(err: anyhow::Error) -> Self {
        PtyError::SpawnFailed(err.to_string())
    }
}
