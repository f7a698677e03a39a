//! RecoveryManager - startup pass over orphaned tasks.
//!
//! An orphan is a task still `Processing` when its monitor starts: the
//! previous process died while running it. Per orphan:
//!
//! 1. effective retry count = max(`retry_count`, `"Retry: N"` message)
//! 2. under `ParentPolicy::FollowParent`, an orphan whose parent is missing,
//!    `Queued`, `Processing`, `Error` or `Canceled` is canceled and nothing
//!    else happens to it
//! 3. sub-tasks are canceled per the pipeline's `SubTaskPolicy`
//! 4. `count + 1 > max_retries` -> `Error` (RETRY_LIMIT_EXCEEDED), otherwise
//!    requeue with `count + 1`
//!
//! Step 2 mirrors what the parent's own pass does to in-flight sub-tasks, so
//! a parent/child pair ends in the same state whichever monitor recovers
//! first.
//!
//! Every write is its own store call, sub-tasks before the parent, so a
//! crash mid-recovery leaves the parent `Processing` for the next pass.
//!
//! Passes of different monitors in one process are serialized by a shared
//! lock (they touch the same parent/child rows).

use std::sync::{Arc, OnceLock};

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::domain::{ErrorKind, FailureReason, TaskRecord, TaskStatus};
use crate::pipelines::{ParentPolicy, PipelineProfile, SubTaskPolicy};
use crate::ports::{StoreError, TaskStore};

/// Lock shared by every `RecoveryManager` built with `new`.
fn process_lock() -> Arc<Mutex<()>> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    Arc::clone(LOCK.get_or_init(|| Arc::new(Mutex::new(()))))
}

/// What happened to one orphan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDecision {
    Requeued { retry_count: u32 },
    RetryLimitExceeded { retry_count: u32 },
    /// Dropped together with a parent that will not let it finish.
    Canceled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub failed: usize,
    /// Orphans canceled because of their parent's state.
    pub canceled: usize,
    pub canceled_sub_tasks: usize,
    /// Orphans whose decision could not be persisted; they stay
    /// `Processing` until the next pass.
    pub errors: usize,
}

/// Startup pass that settles orphans of one pipeline.
///
/// # Design principles
/// - one store call per write, children before parents
/// - a failed write is counted and left for the next pass, never retried
///   in a loop
/// - passes share a lock, so concurrent monitors see each other's writes
pub struct RecoveryManager {
    store: Arc<dyn TaskStore>,
    max_retries: u32,
    lock: Arc<Mutex<()>>,
}

impl RecoveryManager {
    pub fn new(store: Arc<dyn TaskStore>, max_retries: u32) -> Self {
        Self::with_lock(store, max_retries, process_lock())
    }

    /// Use an explicit lock instead of the process-wide one.
    pub fn with_lock(store: Arc<dyn TaskStore>, max_retries: u32, lock: Arc<Mutex<()>>) -> Self {
        Self {
            store,
            max_retries,
            lock,
        }
    }

    /// Run one pass for `profile`'s pipeline.
    ///
    /// Only listing the orphans can fail the pass; per-orphan failures are
    /// logged and counted.
    pub async fn recover(&self, profile: &PipelineProfile) -> Result<RecoveryReport, StoreError> {
        let _guard = self.lock.lock().await;
        let orphans = self.store.find_orphaned(&profile.orphans).await?;
        if orphans.is_empty() {
            return Ok(RecoveryReport::default());
        }
        info!(kind = %profile.kind, orphans = orphans.len(), "recovering orphaned tasks");

        let mut report = RecoveryReport::default();
        for orphan in orphans {
            match self.recover_one(&orphan, profile).await {
                Ok((decision, canceled)) => {
                    report.canceled_sub_tasks += canceled;
                    match decision {
                        RecoveryDecision::Requeued { retry_count } => {
                            report.requeued += 1;
                            info!(task_id = %orphan.id, retry_count, "orphan requeued");
                        }
                        RecoveryDecision::RetryLimitExceeded { retry_count } => {
                            report.failed += 1;
                            warn!(task_id = %orphan.id, retry_count, max_retries = self.max_retries, "orphan exceeded retry limit");
                        }
                        RecoveryDecision::Canceled => {
                            report.canceled += 1;
                            info!(task_id = %orphan.id, parent_id = ?orphan.parent_id, "orphan canceled with its parent");
                        }
                    }
                }
                Err(e) => {
                    report.errors += 1;
                    error!(task_id = %orphan.id, error = %e, "recovery decision not persisted");
                }
            }
        }
        Ok(report)
    }

    async fn recover_one(
        &self,
        orphan: &TaskRecord,
        profile: &PipelineProfile,
    ) -> Result<(RecoveryDecision, usize), StoreError> {
        if profile.parent == ParentPolicy::FollowParent && self.parent_blocks(orphan).await? {
            let reason = match orphan.parent_id {
                Some(parent) => format!("Canceled: parent {parent} is not settled"),
                None => "Canceled: parent is not settled".to_string(),
            };
            // Cascades to the orphan's own sub-tasks.
            let canceled = self.store.cancel(orphan.id, &reason).await?.len();
            return Ok((RecoveryDecision::Canceled, canceled.saturating_sub(1)));
        }

        let retry_count = orphan.effective_retry_count();
        let exhausted = retry_count.saturating_add(1) > self.max_retries;

        let canceled = match profile.sub_tasks {
            SubTaskPolicy::Ignore => 0,
            SubTaskPolicy::CancelInFlight { prerequisite } => {
                // A parent that will never run again takes all of its
                // sub-tasks with it.
                let cancel_all = exhausted || !orphan.has_checkpoint(prerequisite);
                self.cancel_sub_tasks(orphan, cancel_all).await?
            }
        };

        if exhausted {
            let message = format!(
                "Retry limit exceeded: {retry_count} retries, max {}",
                self.max_retries
            );
            self.store
                .fail(
                    orphan.id,
                    FailureReason::new(ErrorKind::RetryLimitExceeded, message),
                )
                .await?;
            Ok((RecoveryDecision::RetryLimitExceeded { retry_count }, canceled))
        } else {
            let next = retry_count + 1;
            self.store.requeue(orphan.id, next).await?;
            Ok((RecoveryDecision::Requeued { retry_count: next }, canceled))
        }
    }

    /// True when `orphan` has a parent that is gone, will run again, or
    /// ended unsuccessfully.
    async fn parent_blocks(&self, orphan: &TaskRecord) -> Result<bool, StoreError> {
        let Some(parent_id) = orphan.parent_id else {
            return Ok(false);
        };
        let blocks = match self.store.get(parent_id).await? {
            None => true,
            Some(parent) => matches!(
                parent.status,
                TaskStatus::Queued
                    | TaskStatus::Processing
                    | TaskStatus::Error
                    | TaskStatus::Canceled
            ),
        };
        Ok(blocks)
    }

    async fn cancel_sub_tasks(&self, parent: &TaskRecord, all: bool) -> Result<usize, StoreError> {
        let reason = format!("Canceled: parent {} recovered after interruption", parent.id);
        let mut canceled = 0;
        for child in self.store.children(parent.id).await? {
            let selected = if all {
                !child.status.is_terminal()
            } else {
                child.status == TaskStatus::Processing
            };
            if selected {
                canceled += self.store.cancel(child.id, &reason).await?.len();
            }
        }
        Ok(canceled)
    }
}
