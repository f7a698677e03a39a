//! ExecutionBackend port - the out-of-process system that does the actual
//! document work.
//!
//! The core drives it through submit / poll / fetch / cancel / delete. A
//! push-based backend can sit behind the same trait by buffering its
//! callbacks into the status returned by `poll_status`.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unknown backend job: {0}")]
    UnknownJob(BackendHandle),

    #[error("backend job {0} has no artifacts yet")]
    NotReady(BackendHandle),

    #[error("backend rejected job: {0}")]
    Rejected(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Opaque handle of a submitted backend job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendHandle(String);

impl BackendHandle {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a backend job should do with its input document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BackendOperation {
    /// Produce a `hierarchy.json` artifact describing the document's fields.
    ExtractHierarchy,
    /// Produce a `reduced.json` artifact with only the selected field paths.
    Reduce { selections: Vec<String> },
    /// Produce a `published.json` artifact ready for distribution.
    Publish,
}

impl BackendOperation {
    /// Short name used in logs and error messages.
    pub fn stage(&self) -> &'static str {
        match self {
            BackendOperation::ExtractHierarchy => "extract_hierarchy",
            BackendOperation::Reduce { .. } => "reduce",
            BackendOperation::Publish => "publish",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendJob {
    /// Caller-chosen label, unique per execution (task id + stage).
    pub label: String,
    pub operation: BackendOperation,
    /// Input document inside the runner's private working area.
    pub input: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendArtifact {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// The document-processing system behind the runners.
///
/// # Testability
/// `SimulatedBackend` implements the whole lifecycle in memory and can be
/// scripted to stall or fail at any point, so runners and the polling loop
/// are tested without a real backend.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn submit(&self, job: BackendJob) -> Result<BackendHandle, BackendError>;

    async fn poll_status(&self, handle: &BackendHandle) -> Result<BackendStatus, BackendError>;

    /// Artifacts of a `Succeeded` job.
    async fn fetch_artifacts(
        &self,
        handle: &BackendHandle,
    ) -> Result<Vec<BackendArtifact>, BackendError>;

    /// Ask the backend to stop a running job. Idempotent.
    async fn cancel(&self, handle: &BackendHandle) -> Result<(), BackendError>;

    /// Drop the backend-side job registration. Idempotent.
    async fn delete(&self, handle: &BackendHandle) -> Result<(), BackendError>;
}
