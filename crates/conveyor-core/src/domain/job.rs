//! JobDetail: the execution-side view of a claimed task.
//!
//! A runner only ever sees a `JobDetail`. It is built once from the
//! persisted record when the task is claimed (`from_task`) and mapped back
//! once when the runner finishes (`into_outcome`). Both are plain functions
//! so the mapping can be tested without a store or a runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::outcome::{ErrorKind, FailureReason, OutcomeMetadata};
use super::state::{JobStatus, TaskStatus};
use super::task::{ContentType, TaskRecord};

/// Immutable input of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub content_type: ContentType,
    pub content_id: String,
    pub parent_id: Option<TaskId>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Accumulates while the runner executes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobResult {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureReason>,
    /// Result document produced by the runner.
    pub output: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub id: TaskId,
    pub status: JobStatus,
    pub request: JobRequest,
    pub result: JobResult,
}

impl JobDetail {
    pub fn from_task(task: &TaskRecord) -> Self {
        Self {
            id: task.id,
            status: JobStatus::Pending,
            request: JobRequest {
                content_type: task.content_type.clone(),
                content_id: task.content_id.clone(),
                parent_id: task.parent_id,
                retry_count: task.effective_retry_count(),
                created_at: task.created_at,
                payload: task.payload.clone(),
            },
            result: JobResult::default(),
        }
    }

    pub fn mark_started(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.result.started_at = Some(now);
    }

    pub fn succeed(&mut self, output: serde_json::Value, now: DateTime<Utc>) {
        self.status = JobStatus::Succeeded;
        self.result.output = output;
        self.result.failure = None;
        self.result.finished_at = Some(now);
    }

    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.result.failure = Some(FailureReason::new(kind, message));
        self.result.finished_at = Some(now);
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Canceled;
        self.result.finished_at = Some(now);
    }

    /// Map back to the persisted status and outcome.
    ///
    /// A detail that never reached a finished state is recorded as `Error`.
    pub fn into_outcome(self) -> (TaskStatus, OutcomeMetadata) {
        let mut failure = self.result.failure;
        let status = match self.status {
            JobStatus::Succeeded => TaskStatus::Success,
            JobStatus::Canceled => TaskStatus::Canceled,
            JobStatus::Failed => TaskStatus::Error,
            JobStatus::Pending | JobStatus::Running => {
                failure.get_or_insert_with(|| {
                    FailureReason::new(
                        ErrorKind::RunnerPanic,
                        "runner returned before reaching a final status",
                    )
                });
                TaskStatus::Error
            }
        };
        let outcome = OutcomeMetadata {
            started_at: self.result.started_at,
            finished_at: self.result.finished_at,
            failure,
            result: self.result.output,
        };
        (status, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::TaskId;
    use crate::domain::task::{NewTask, PipelineKind};
    use chrono::TimeZone;
    use serde_json::json;
    use ulid::Ulid;

    fn record() -> TaskRecord {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut task = TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            NewTask::new(
                PipelineKind::Reduction,
                ContentType::new("reduction.document.v1"),
                "doc-1",
                json!({"selections": ["a"]}),
            ),
            now,
        );
        task.status = TaskStatus::Processing;
        task.status_message = Some("Retry: 2".to_string());
        task
    }

    #[test]
    fn from_task_copies_request_fields() {
        let task = record();
        let detail = JobDetail::from_task(&task);
        assert_eq!(detail.id, task.id);
        assert_eq!(detail.status, JobStatus::Pending);
        assert_eq!(detail.request.content_id, "doc-1");
        assert_eq!(detail.request.retry_count, 2);
        assert_eq!(detail.request.payload, task.payload);
        assert_eq!(detail.result, JobResult::default());
    }

    #[test]
    fn succeeded_maps_to_success_with_output() {
        let now = Utc::now();
        let mut detail = JobDetail::from_task(&record());
        detail.mark_started(now);
        detail.succeed(json!({"checksum": "abc"}), now);
        let (status, outcome) = detail.into_outcome();
        assert_eq!(status, TaskStatus::Success);
        assert_eq!(outcome.result["checksum"], "abc");
        assert!(outcome.failure.is_none());
        assert_eq!(outcome.duration_ms(), Some(0));
    }

    #[test]
    fn failed_and_canceled_map_to_their_statuses() {
        let now = Utc::now();
        let mut failed = JobDetail::from_task(&record());
        failed.fail(ErrorKind::BackendTimeout, "start window exceeded", now);
        let (status, outcome) = failed.into_outcome();
        assert_eq!(status, TaskStatus::Error);
        assert_eq!(outcome.failure.unwrap().kind, ErrorKind::BackendTimeout);

        let mut canceled = JobDetail::from_task(&record());
        canceled.cancel(now);
        assert_eq!(canceled.into_outcome().0, TaskStatus::Canceled);
    }

    #[test]
    fn unfinished_detail_is_an_error() {
        let mut detail = JobDetail::from_task(&record());
        detail.mark_started(Utc::now());
        let (status, outcome) = detail.into_outcome();
        assert_eq!(status, TaskStatus::Error);
        assert_eq!(outcome.failure.unwrap().kind, ErrorKind::RunnerPanic);
    }
}
