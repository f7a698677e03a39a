//! Domain model: ids, task records, statuses, job detail, outcomes.
//!
//! Nothing here does I/O. Stores, backends and runners build on these types.

pub mod errors;
pub mod events;
pub mod hierarchy;
pub mod ids;
pub mod job;
pub mod outcome;
pub mod retry;
pub mod state;
pub mod task;

pub use errors::{RunError, TimeoutWindow};
pub use events::{AuditAction, AuditEvent};
pub use hierarchy::{FieldNode, reduce_document};
pub use ids::{ParseIdError, TaskId};
pub use job::{JobDetail, JobRequest, JobResult};
pub use outcome::{ErrorKind, FailureReason, OutcomeMetadata};
pub use retry::{effective_retry_count, format_retry_message, parse_retry_count};
pub use state::{JobStatus, MonitorState, TaskStatus, UnknownStatus};
pub use task::{ContentType, NewTask, PipelineKind, TaskRecord, UnknownKind};
