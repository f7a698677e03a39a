//! Runner error taxonomy.
//!
//! Every failure inside one execution is one of these. The runner boundary
//! turns it into a `JobStatus` + `FailureReason`; nothing here ever reaches
//! the monitor loop as an `Err`.

use std::time::Duration;

use thiserror::Error;

use super::outcome::ErrorKind;

/// Which backend timeout window was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutWindow {
    /// Job never left `NotStarted`.
    Start,
    /// Job started but did not finish.
    Finish,
}

impl std::fmt::Display for TimeoutWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutWindow::Start => f.write_str("start"),
            TimeoutWindow::Finish => f.write_str("finish"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("backend {stage} timed out: {window} window of {limit:?} exceeded")]
    BackendTimeout {
        stage: String,
        window: TimeoutWindow,
        limit: Duration,
    },

    #[error("backend {stage} failed: {message}")]
    BackendFailure { stage: String, message: String },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("io error during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A mid-flight write to the task store (checkpoint) failed.
    #[error("persisting progress failed: {0}")]
    Persistence(String),

    /// Administrative or shutdown cancellation. Not a failure.
    #[error("execution canceled")]
    Canceled,
}

impl RunError {
    pub fn validation(message: impl Into<String>) -> Self {
        RunError::Validation(message.into())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        RunError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn backend(stage: impl Into<String>, message: impl std::fmt::Display) -> Self {
        RunError::BackendFailure {
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    /// Outcome classification. `None` for cancellation.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RunError::Validation(_) => Some(ErrorKind::Validation),
            RunError::BackendTimeout { .. } => Some(ErrorKind::BackendTimeout),
            RunError::BackendFailure { .. } => Some(ErrorKind::BackendFailure),
            RunError::ChecksumMismatch { .. } => Some(ErrorKind::ChecksumMismatch),
            RunError::Io { .. } => Some(ErrorKind::Io),
            RunError::Persistence(_) => Some(ErrorKind::Persistence),
            RunError::Canceled => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, RunError::Canceled)
    }
}
