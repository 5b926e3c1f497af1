use crate::process::ProcessError;
use crate::pump::StreamKind;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by session operations
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to start conversation: {0}")]
    Spawn(#[source] ProcessError),

    #[error("Failed to write to conversation input: {0}")]
    Write(#[source] std::io::Error),

    #[error("Child {stream} ended unexpectedly")]
    ReadEnded { stream: StreamKind },

    #[error("Pause/resume unavailable: {0}")]
    SignalUnsupported(String),

    #[error("Child did not exit within {0:?} of the exit request")]
    ShutdownTimeout(Duration),

    #[error("Failed to signal child: {0}")]
    Signal(#[source] ProcessError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Classify a failed signal delivery
    pub fn from_signal(error: ProcessError) -> Self {
        match error {
            ProcessError::UnsupportedOperation(msg) => SessionError::SignalUnsupported(msg),
            other => SessionError::Signal(other),
        }
    }

    /// Errors the session recovers from locally; the conversation keeps running
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::Write(_)
                | SessionError::ReadEnded { .. }
                | SessionError::SignalUnsupported(_)
                | SessionError::ShutdownTimeout(_)
                | SessionError::Signal(_)
        )
    }
}
