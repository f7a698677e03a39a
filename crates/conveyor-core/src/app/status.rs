//! Status - point-in-time view of an engine.

use serde::{Deserialize, Serialize};

use crate::domain::{MonitorState, PipelineKind};
use crate::ports::QueueCounts;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub kind: PipelineKind,
    pub state: MonitorState,
    pub max_concurrent_runners: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub monitors: Vec<MonitorStatus>,
    pub queue: QueueCounts,
}

impl EngineStatus {
    /// Every monitor reached `Stopped`.
    pub fn is_stopped(&self) -> bool {
        self.monitors
            .iter()
            .all(|m| m.state == MonitorState::Stopped)
    }
}
