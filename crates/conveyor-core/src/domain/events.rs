//! Audit events emitted by runners at phase boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::task::ContentType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ValidationFailed,
    HierarchyExtracted,
    Reduced,
    Published,
    ExecutionFailed,
    ExecutionCanceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub task_id: TaskId,
    pub content_type: ContentType,
    pub content_id: String,
    pub action: AuditAction,
    pub detail: String,
    pub at: DateTime<Utc>,
}
