//! In-memory TaskStore.
//!
//! One `tokio::sync::Mutex` around the whole table is the transaction
//! boundary: a claim selects and marks under a single lock acquisition, so
//! two concurrent claims can never return the same task.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{
    FailureReason, NewTask, OutcomeMetadata, TaskId, TaskRecord, TaskStatus, format_retry_message,
};
use crate::ports::{
    ClaimFilter, Clock, IdGenerator, OrphanFilter, PersistResult, QueueCounts, StoreError,
    SystemClock, TaskStore, UlidGenerator,
};

#[derive(Default)]
struct InMemoryStoreState {
    tasks: HashMap<TaskId, TaskRecord>,
}

impl InMemoryStoreState {
    fn get_mut(&mut self, id: TaskId) -> Result<&mut TaskRecord, StoreError> {
        self.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))
    }

    fn processing_mut(&mut self, id: TaskId) -> Result<&mut TaskRecord, StoreError> {
        let task = self.get_mut(id)?;
        if task.status != TaskStatus::Processing {
            return Err(StoreError::NotProcessing {
                id,
                status: task.status,
            });
        }
        Ok(task)
    }

    /// Oldest first; ties broken by id so the order is total.
    fn sorted<'a>(tasks: impl Iterator<Item = &'a TaskRecord>) -> Vec<&'a TaskRecord> {
        let mut tasks: Vec<&TaskRecord> = tasks.collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        tasks
    }

    fn select_claimable(
        &self,
        max_count: usize,
        filter: &ClaimFilter,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Vec<TaskId> {
        let parent_ready = |task: &TaskRecord| match (&filter.parent_checkpoint, task.parent_id) {
            (Some(checkpoint), Some(parent_id)) => self
                .tasks
                .get(&parent_id)
                .is_some_and(|parent| parent.has_checkpoint(checkpoint)),
            _ => true,
        };

        let queued = Self::sorted(
            self.tasks
                .values()
                .filter(|t| t.status == TaskStatus::Queued && t.kind == filter.kind),
        );

        // Content ids whose head task is already taken (in flight or seen).
        let mut blocked: HashSet<&str> = if filter.serialize_per_content {
            self.tasks
                .values()
                .filter(|t| t.status == TaskStatus::Processing && t.kind == filter.kind)
                .map(|t| t.content_id.as_str())
                .collect()
        } else {
            HashSet::new()
        };

        let mut chosen = Vec::new();
        for task in queued {
            if chosen.len() >= max_count {
                break;
            }
            if filter.serialize_per_content && !blocked.insert(task.content_id.as_str()) {
                continue;
            }
            if filter.admits_row(task, now) && parent_ready(task) {
                chosen.push(task.id);
            }
        }
        chosen
    }
}

/// In-memory queue used by tests and the demo binary.
pub struct InMemoryTaskStore {
    state: Arc<Mutex<InMemoryStoreState>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self {
            state: Arc::new(Mutex::new(InMemoryStoreState::default())),
            clock,
            ids,
        }
    }

    /// Insert a record as-is, whatever its status. Fixture helper for
    /// simulating rows left behind by another process.
    pub async fn seed(&self, record: TaskRecord) {
        let mut state = self.state.lock().await;
        state.tasks.insert(record.id, record);
    }

    /// Administrative status edit outside the engine (e.g. `Live`).
    pub async fn set_status(&self, id: TaskId, status: TaskStatus) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task = state.get_mut(id)?;
        task.status = status;
        task.updated_at = now;
        Ok(())
    }

    pub async fn all(&self) -> Vec<TaskRecord> {
        let state = self.state.lock().await;
        InMemoryStoreState::sorted(state.tasks.values())
            .into_iter()
            .cloned()
            .collect()
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, task: NewTask) -> Result<TaskRecord, StoreError> {
        let id = self.ids.generate_task_id();
        let record = TaskRecord::new(id, task, self.clock.now());
        let mut state = self.state.lock().await;
        state.tasks.insert(id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&id).cloned())
    }

    async fn children(&self, parent_id: TaskId) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(InMemoryStoreState::sorted(
            state
                .tasks
                .values()
                .filter(|t| t.parent_id == Some(parent_id)),
        )
        .into_iter()
        .cloned()
        .collect())
    }

    async fn claim_ready(
        &self,
        max_count: usize,
        filter: &ClaimFilter,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let ids = state.select_claimable(max_count, filter, now);

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let task = state.get_mut(id)?;
            task.status = TaskStatus::Processing;
            task.updated_at = now;
            claimed.push(task.clone());
        }
        debug!(kind = %filter.kind, claimed = claimed.len(), "claimed tasks");
        Ok(claimed)
    }

    async fn persist_outcome(
        &self,
        id: TaskId,
        status: TaskStatus,
        outcome: OutcomeMetadata,
    ) -> Result<PersistResult, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task = state.get_mut(id)?;
        match task.status {
            TaskStatus::Canceled => Ok(PersistResult::DiscardedCanceled),
            TaskStatus::Processing => {
                if !matches!(
                    status,
                    TaskStatus::Success | TaskStatus::Error | TaskStatus::Canceled
                ) {
                    return Err(StoreError::InvalidTransition {
                        id,
                        from: task.status,
                        to: status,
                    });
                }
                if let Some(message) = outcome.status_message() {
                    task.status_message = Some(message);
                }
                task.status = status;
                task.outcome = Some(outcome);
                task.updated_at = now;
                Ok(PersistResult::Applied)
            }
            other => Err(StoreError::NotProcessing { id, status: other }),
        }
    }

    async fn find_orphaned(&self, filter: &OrphanFilter) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(
            InMemoryStoreState::sorted(state.tasks.values().filter(|t| filter.admits(t)))
                .into_iter()
                .cloned()
                .collect(),
        )
    }

    async fn requeue(&self, id: TaskId, retry_count: u32) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task = state.processing_mut(id)?;
        task.status = TaskStatus::Queued;
        task.retry_count = retry_count;
        task.status_message = Some(format_retry_message(retry_count));
        task.checkpoints.clear();
        task.outcome = None;
        task.updated_at = now;
        Ok(())
    }

    async fn fail(&self, id: TaskId, failure: FailureReason) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task = state.processing_mut(id)?;
        task.status = TaskStatus::Error;
        task.status_message = Some(failure.message.clone());
        task.outcome = Some(OutcomeMetadata {
            finished_at: Some(now),
            ..OutcomeMetadata::failed(failure.kind, failure.message)
        });
        task.updated_at = now;
        Ok(())
    }

    async fn cancel(&self, id: TaskId, reason: &str) -> Result<Vec<TaskId>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.get_mut(id)?.status.is_terminal() {
            return Ok(Vec::new());
        }

        let mut changed = Vec::new();
        let mut pending = VecDeque::from([id]);
        while let Some(next) = pending.pop_front() {
            let Some(task) = state.tasks.get_mut(&next) else {
                continue;
            };
            if task.status.is_terminal() {
                continue;
            }
            task.status = TaskStatus::Canceled;
            task.status_message = Some(reason.to_string());
            task.updated_at = now;
            changed.push(next);
            pending.extend(
                state
                    .tasks
                    .values()
                    .filter(|t| t.parent_id == Some(next))
                    .map(|t| t.id),
            );
        }
        Ok(changed)
    }

    async fn record_checkpoint(&self, id: TaskId, checkpoint: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task = state.processing_mut(id)?;
        task.checkpoints.insert(checkpoint.to_string());
        task.updated_at = now;
        Ok(())
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for task in state.tasks.values() {
            counts.add(task.status, 1);
        }
        Ok(counts)
    }
}
