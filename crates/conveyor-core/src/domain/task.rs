//! Persisted task record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use super::ids::TaskId;
use super::outcome::OutcomeMetadata;
use super::retry::effective_retry_count;
use super::state::TaskStatus;

/// Names the runner implementation for a task (`publication.document.v1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentType(String);

impl ContentType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which pipeline a task belongs to. One monitor serves one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineKind {
    Publication,
    Reduction,
}

impl PipelineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineKind::Publication => "Publication",
            PipelineKind::Reduction => "Reduction",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown pipeline kind '{0}'")]
pub struct UnknownKind(pub String);

impl FromStr for PipelineKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [PipelineKind::Publication, PipelineKind::Reduction]
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Input for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub kind: PipelineKind,
    pub content_type: ContentType,
    /// Groups tasks that act on the same content (ordering is per content).
    pub content_id: String,
    pub payload: serde_json::Value,
    pub parent_id: Option<TaskId>,
}

impl NewTask {
    pub fn new(
        kind: PipelineKind,
        content_type: ContentType,
        content_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            content_type,
            content_id: content_id.into(),
            payload,
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

/// A persisted unit of schedulable work.
///
/// This is the persistence-side shape. Runners never see it: they get a
/// `JobDetail` built by `JobDetail::from_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: PipelineKind,
    pub content_type: ContentType,
    pub content_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub status_message: Option<String>,
    pub retry_count: u32,
    pub payload: serde_json::Value,
    pub outcome: Option<OutcomeMetadata>,
    pub parent_id: Option<TaskId>,
    /// Progress markers recorded by the runner while `Processing`.
    #[serde(default)]
    pub checkpoints: BTreeSet<String>,
}

impl TaskRecord {
    pub fn new(id: TaskId, task: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: task.kind,
            content_type: task.content_type,
            content_id: task.content_id,
            created_at: now,
            updated_at: now,
            status: TaskStatus::Queued,
            status_message: None,
            retry_count: 0,
            payload: task.payload,
            outcome: None,
            parent_id: task.parent_id,
            checkpoints: BTreeSet::new(),
        }
    }

    pub fn has_checkpoint(&self, name: &str) -> bool {
        self.checkpoints.contains(name)
    }

    /// Retry count as recovery sees it (field or legacy message).
    pub fn effective_retry_count(&self) -> u32 {
        effective_retry_count(self.retry_count, self.status_message.as_deref())
    }
}
