//! Outcome metadata persisted with a finished task.
//!
//! This module does not assume a store or a runner. It only defines the
//! shape of what gets recorded so an operator can explain a result later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a failure.
///
/// Serialized as SCREAMING_SNAKE_CASE so raw rows read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Precondition not met. Terminal for this execution.
    Validation,
    /// Backend start or finish window exceeded.
    BackendTimeout,
    /// Backend reported failure, or a backend call errored.
    BackendFailure,
    /// Input content did not match its declared checksum.
    ChecksumMismatch,
    /// Local file I/O failed.
    Io,
    /// A task store write made by the runner failed.
    Persistence,
    /// The runner task panicked or was aborted.
    RunnerPanic,
    /// Recovery gave up on the task.
    RetryLimitExceeded,
}

/// Structured failure reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: ErrorKind,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Timing, failure and result document of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,

    /// Runner-produced result (output path, checksum, hierarchy, ...).
    #[serde(default)]
    pub result: serde_json::Value,
}

impl OutcomeMetadata {
    pub fn empty() -> Self {
        Self {
            started_at: None,
            finished_at: None,
            failure: None,
            result: serde_json::Value::Null,
        }
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            failure: Some(FailureReason::new(kind, message)),
            ..Self::empty()
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    /// Human-readable message for the task's status message column.
    pub fn status_message(&self) -> Option<String> {
        self.failure.as_ref().map(|f| f.message.clone())
    }
}
