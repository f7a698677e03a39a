//! Task and job status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Persisted task status.
///
/// State transitions:
/// - Queued -> Processing -> Success | Error | Canceled
/// - Processing -> Queued (recovery requeue only)
/// - Success -> Replaced | Discarded | Live (applied by other collaborators)
///
/// Only a claim moves a task out of `Queued`. The reduction pipeline's
/// "Reducing" / "Reduced" are `Processing` / `Success` here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    Processing,
    Success,
    Error,
    Canceled,
    Replaced,
    Discarded,
    Live,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Queued,
        TaskStatus::Processing,
        TaskStatus::Success,
        TaskStatus::Error,
        TaskStatus::Canceled,
        TaskStatus::Replaced,
        TaskStatus::Discarded,
        TaskStatus::Live,
    ];

    /// No further transition by the engine.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Queued | TaskStatus::Processing)
    }

    /// Claimed and not yet resolved.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "Queued",
            TaskStatus::Processing => "Processing",
            TaskStatus::Success => "Success",
            TaskStatus::Error => "Error",
            TaskStatus::Canceled => "Canceled",
            TaskStatus::Replaced => "Replaced",
            TaskStatus::Discarded => "Discarded",
            TaskStatus::Live => "Live",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown task status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Execution-side status of a `JobDetail`.
///
/// Independent of `TaskStatus` so runners never see persistence states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

/// Lifecycle of a monitor instance.
///
/// `Idle -> Running -> Draining -> Stopped`. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorState {
    Idle,
    Running,
    Draining,
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("Reducing".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn only_queued_and_processing_are_open() {
        let open: Vec<_> = TaskStatus::ALL
            .into_iter()
            .filter(|s| !s.is_terminal())
            .collect();
        assert_eq!(open, vec![TaskStatus::Queued, TaskStatus::Processing]);
    }
}
