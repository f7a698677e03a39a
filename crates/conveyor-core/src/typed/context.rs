//! RunContext - everything one execution may touch.
//!
//! `RunServices` is shared by a monitor and stamps out one `RunContext` per
//! claimed task. The context owns the task's working area and remembers
//! every backend job it submitted, so cleanup can cancel and delete them
//! whichever phase failed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::polling::{PollWindows, wait_for_completion};
use super::workspace::{Distributed, WorkingArea, distribute};
use crate::app::config::RunnerConfig;
use crate::domain::{AuditAction, AuditEvent, ContentType, JobDetail, RunError, TaskId};
use crate::ports::{
    AuditSink, BackendArtifact, BackendHandle, BackendJob, BackendOperation, Clock,
    ExecutionBackend, ProgressSink,
};

/// Collaborators shared by every execution of one monitor.
#[derive(Clone)]
pub struct RunServices {
    pub backend: Arc<dyn ExecutionBackend>,
    pub audit: Arc<dyn AuditSink>,
    pub progress: Arc<dyn ProgressSink>,
    pub clock: Arc<dyn Clock>,
    pub settings: RunnerConfig,
    pub workspace_root: PathBuf,
    pub publish_root: PathBuf,
}

impl RunServices {
    pub fn context_for(&self, detail: &JobDetail, cancel: CancellationToken) -> RunContext {
        RunContext {
            task_id: detail.id,
            content_type: detail.request.content_type.clone(),
            content_id: detail.request.content_id.clone(),
            cancel,
            workspace: WorkingArea::for_task(&self.workspace_root, detail.id),
            services: self.clone(),
            submitted: Mutex::new(Vec::new()),
        }
    }
}

struct SubmittedJob {
    handle: BackendHandle,
    finished: bool,
}

pub struct RunContext {
    task_id: TaskId,
    content_type: ContentType,
    content_id: String,
    cancel: CancellationToken,
    workspace: WorkingArea,
    services: RunServices,
    submitted: Mutex<Vec<SubmittedJob>>,
}

impl RunContext {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// `Err(Canceled)` once the scope is canceled. Call between phases.
    pub fn ensure_active(&self) -> Result<(), RunError> {
        if self.cancel.is_cancelled() {
            return Err(RunError::Canceled);
        }
        Ok(())
    }

    pub fn workspace(&self) -> &WorkingArea {
        &self.workspace
    }

    pub fn publish_root(&self) -> &Path {
        &self.services.publish_root
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    /// Report a phase boundary. Sink failures are logged only.
    pub async fn audit(&self, action: AuditAction, detail: impl Into<String>) {
        let event = AuditEvent {
            task_id: self.task_id,
            content_type: self.content_type.clone(),
            content_id: self.content_id.clone(),
            action,
            detail: detail.into(),
            at: self.now(),
        };
        if let Err(e) = self.services.audit.record(event).await {
            warn!(task_id = %self.task_id, ?action, error = %e, "audit event dropped");
        }
    }

    /// Persist a named checkpoint on the running task.
    pub async fn checkpoint(&self, name: &str) -> Result<(), RunError> {
        self.services
            .progress
            .checkpoint(self.task_id, name)
            .await
            .map_err(|e| RunError::Persistence(e.to_string()))
    }

    /// Submit a backend job, poll it to completion and fetch its artifacts.
    pub async fn run_backend(
        &self,
        operation: BackendOperation,
        input: PathBuf,
    ) -> Result<Vec<BackendArtifact>, RunError> {
        self.ensure_active()?;
        let stage = operation.stage();
        let backend = self.services.backend.as_ref();

        let handle = backend
            .submit(BackendJob {
                label: format!("{}/{stage}", self.task_id),
                operation,
                input,
            })
            .await
            .map_err(|e| RunError::backend(stage, e))?;
        self.lock_submitted().push(SubmittedJob {
            handle: handle.clone(),
            finished: false,
        });

        wait_for_completion(
            backend,
            &handle,
            stage,
            PollWindows::from(&self.services.settings),
            &self.cancel,
        )
        .await?;
        self.mark_finished(&handle);

        backend
            .fetch_artifacts(&handle)
            .await
            .map_err(|e| RunError::backend(stage, e))
    }

    /// Publish an artifact under `<publish_root>/<content_id>/<task_id>/`.
    pub async fn distribute(&self, name: &str, bytes: &[u8]) -> Result<Distributed, RunError> {
        distribute(self.publish_root(), &self.content_id, self.task_id, name, bytes).await
    }

    /// Cancel unfinished backend jobs, delete every backend job, remove the
    /// working area. Never fails; problems are logged.
    pub async fn cleanup(&self) {
        let submitted: Vec<SubmittedJob> = std::mem::take(&mut *self.lock_submitted());
        let backend = self.services.backend.as_ref();
        for job in submitted {
            if !job.finished
                && let Err(e) = backend.cancel(&job.handle).await
            {
                warn!(task_id = %self.task_id, handle = %job.handle, error = %e, "backend cancel failed");
            }
            if let Err(e) = backend.delete(&job.handle).await {
                warn!(task_id = %self.task_id, handle = %job.handle, error = %e, "backend delete failed");
            }
        }
        if let Err(e) = self.workspace.remove().await {
            warn!(task_id = %self.task_id, path = %self.workspace.path().display(), error = %e, "working area not removed");
        }
    }

    fn mark_finished(&self, handle: &BackendHandle) {
        if let Some(job) = self
            .lock_submitted()
            .iter_mut()
            .find(|j| &j.handle == handle)
        {
            job.finished = true;
        }
    }

    fn lock_submitted(&self) -> std::sync::MutexGuard<'_, Vec<SubmittedJob>> {
        self.submitted.lock().unwrap_or_else(|e| e.into_inner())
    }
}
