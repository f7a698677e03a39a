//! TaskStore port - the sole gateway to the persisted queue.
//!
//! # Design principles
//! - Claim = select eligible `Queued` rows + mark them `Processing` in ONE
//!   transaction. A claimed task is owned by the caller until its outcome is
//!   persisted (or recovery requeues it).
//! - `persist_outcome` never overwrites an administrative `Canceled`.
//! - Implementations: `impls::InMemoryTaskStore` (tests, demo) and
//!   `conveyor-pg::PgTaskStore` (`FOR UPDATE SKIP LOCKED`).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    ContentType, FailureReason, NewTask, OutcomeMetadata, PipelineKind, TaskId, TaskRecord,
    TaskStatus,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {id} is {status}, expected Processing")]
    NotProcessing { id: TaskId, status: TaskStatus },

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Data form of a pipeline's claim predicate.
///
/// Stores evaluate it natively (in-memory scan or SQL WHERE clause), which
/// keeps selection and marking inside one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimFilter {
    pub kind: PipelineKind,
    /// Restrict to these content types. `None` = any.
    pub content_types: Option<Vec<ContentType>>,
    /// Minimum time a task must have been queued (`TaskAgeBeforeExecution`).
    pub min_age: Duration,
    /// Only the oldest queued task of a content id is eligible, and none while
    /// another task of the same kind and content id is `Processing`.
    pub serialize_per_content: bool,
    /// A sub-task is eligible only after its parent recorded this checkpoint.
    pub parent_checkpoint: Option<String>,
}

impl ClaimFilter {
    pub fn new(kind: PipelineKind) -> Self {
        Self {
            kind,
            content_types: None,
            min_age: Duration::ZERO,
            serialize_per_content: false,
            parent_checkpoint: None,
        }
    }

    pub fn with_content_types(mut self, content_types: Vec<ContentType>) -> Self {
        self.content_types = Some(content_types);
        self
    }

    pub fn with_min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }

    pub fn serialize_per_content(mut self) -> Self {
        self.serialize_per_content = true;
        self
    }

    pub fn with_parent_checkpoint(mut self, checkpoint: impl Into<String>) -> Self {
        self.parent_checkpoint = Some(checkpoint.into());
        self
    }

    /// Row-local part of the predicate (status, kind, content type, age).
    ///
    /// The relational parts (`serialize_per_content`, `parent_checkpoint`)
    /// need the rest of the table and are evaluated by the store.
    pub fn admits_row(&self, task: &TaskRecord, now: DateTime<Utc>) -> bool {
        if task.status != TaskStatus::Queued || task.kind != self.kind {
            return false;
        }
        if let Some(types) = &self.content_types
            && !types.contains(&task.content_type)
        {
            return false;
        }
        let min_age = chrono::Duration::from_std(self.min_age).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(task.created_at) >= min_age
    }
}

/// Selects `Processing` tasks for recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanFilter {
    pub kind: PipelineKind,
    pub content_types: Option<Vec<ContentType>>,
}

impl OrphanFilter {
    pub fn new(kind: PipelineKind) -> Self {
        Self {
            kind,
            content_types: None,
        }
    }

    pub fn with_content_types(mut self, content_types: Vec<ContentType>) -> Self {
        self.content_types = Some(content_types);
        self
    }

    pub fn admits(&self, task: &TaskRecord) -> bool {
        task.status == TaskStatus::Processing
            && task.kind == self.kind
            && self
                .content_types
                .as_ref()
                .is_none_or(|types| types.contains(&task.content_type))
    }
}

/// What `persist_outcome` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistResult {
    Applied,
    /// Task was canceled administratively while running; outcome dropped.
    DiscardedCanceled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub processing: usize,
    pub success: usize,
    pub error: usize,
    pub canceled: usize,
    /// Replaced / Discarded / Live.
    pub retired: usize,
}

impl QueueCounts {
    pub fn add(&mut self, status: TaskStatus, n: usize) {
        match status {
            TaskStatus::Queued => self.queued += n,
            TaskStatus::Processing => self.processing += n,
            TaskStatus::Success => self.success += n,
            TaskStatus::Error => self.error += n,
            TaskStatus::Canceled => self.canceled += n,
            TaskStatus::Replaced | TaskStatus::Discarded | TaskStatus::Live => self.retired += n,
        }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new `Queued` task.
    async fn enqueue(&self, task: NewTask) -> Result<TaskRecord, StoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Sub-tasks of `parent_id`, oldest first.
    async fn children(&self, parent_id: TaskId) -> Result<Vec<TaskRecord>, StoreError>;

    /// Claim up to `max_count` eligible tasks, oldest first, marking them
    /// `Processing` in the same transaction. `max_count == 0` claims nothing.
    /// On error nothing is claimed.
    async fn claim_ready(
        &self,
        max_count: usize,
        filter: &ClaimFilter,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Apply a runner's outcome to a `Processing` task.
    ///
    /// A task found `Canceled` keeps its status and the outcome is discarded.
    async fn persist_outcome(
        &self,
        id: TaskId,
        status: TaskStatus,
        outcome: OutcomeMetadata,
    ) -> Result<PersistResult, StoreError>;

    /// `Processing` tasks matching the filter, oldest first.
    async fn find_orphaned(&self, filter: &OrphanFilter) -> Result<Vec<TaskRecord>, StoreError>;

    /// Recovery: `Processing -> Queued` with a new retry count.
    /// Writes the `"Retry: N"` status message and clears checkpoints.
    async fn requeue(&self, id: TaskId, retry_count: u32) -> Result<(), StoreError>;

    /// Recovery: `Processing -> Error`.
    async fn fail(&self, id: TaskId, failure: FailureReason) -> Result<(), StoreError>;

    /// Administrative cancellation of a non-terminal task, cascading to its
    /// non-terminal sub-tasks. Returns every id that changed. Terminal tasks
    /// are left untouched.
    async fn cancel(&self, id: TaskId, reason: &str) -> Result<Vec<TaskId>, StoreError>;

    /// Record a progress checkpoint on a `Processing` task.
    async fn record_checkpoint(&self, id: TaskId, checkpoint: &str) -> Result<(), StoreError>;

    async fn counts(&self) -> Result<QueueCounts, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use ulid::Ulid;

    fn queued(kind: PipelineKind, created_at: DateTime<Utc>) -> TaskRecord {
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            NewTask::new(kind, ContentType::new("publication.document.v1"), "doc", json!({})),
            created_at,
        )
    }

    #[test]
    fn row_filter_checks_kind_status_and_age() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let filter =
            ClaimFilter::new(PipelineKind::Publication).with_min_age(Duration::from_secs(60));
        let task = queued(PipelineKind::Publication, t0);

        assert!(!filter.admits_row(&task, t0 + chrono::Duration::seconds(59)));
        assert!(filter.admits_row(&task, t0 + chrono::Duration::seconds(60)));

        let other_kind = queued(PipelineKind::Reduction, t0);
        assert!(!filter.admits_row(&other_kind, t0 + chrono::Duration::hours(1)));

        let mut processing = queued(PipelineKind::Publication, t0);
        processing.status = TaskStatus::Processing;
        assert!(!filter.admits_row(&processing, t0 + chrono::Duration::hours(1)));
    }

    #[test]
    fn row_filter_honours_content_type_allow_list() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let task = queued(PipelineKind::Publication, t0);
        let allow = ClaimFilter::new(PipelineKind::Publication)
            .with_content_types(vec![ContentType::new("publication.document.v1")]);
        let deny = ClaimFilter::new(PipelineKind::Publication)
            .with_content_types(vec![ContentType::new("publication.video.v1")]);
        assert!(allow.admits_row(&task, t0));
        assert!(!deny.admits_row(&task, t0));
    }

    #[test]
    fn orphan_filter_only_admits_processing() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let filter = OrphanFilter::new(PipelineKind::Publication);
        let mut task = queued(PipelineKind::Publication, t0);
        assert!(!filter.admits(&task));
        task.status = TaskStatus::Processing;
        assert!(filter.admits(&task));
    }
}
