//! ProgressSink port - lets a runner persist checkpoints mid-flight.
//!
//! Runners depend on this trait, not on `TaskStore`, so the runner side
//! stays independent of the persistence schema. `StoreProgress` adapts any
//! store.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::TaskId;
use crate::ports::task_store::{StoreError, TaskStore};

#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn checkpoint(&self, task_id: TaskId, name: &str) -> Result<(), StoreError>;
}

/// `ProgressSink` backed by a `TaskStore`.
pub struct StoreProgress {
    store: Arc<dyn TaskStore>,
}

impl StoreProgress {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProgressSink for StoreProgress {
    async fn checkpoint(&self, task_id: TaskId, name: &str) -> Result<(), StoreError> {
        self.store.record_checkpoint(task_id, name).await
    }
}
