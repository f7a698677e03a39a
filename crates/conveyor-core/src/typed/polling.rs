//! Poll a backend job until it completes.
//!
//! Two independent windows apply: `start_timeout` bounds the time spent
//! `NotStarted` (measured from the first poll), `finish_timeout` bounds the
//! time from the first `Running` observation to completion. The
//! cancellation token is raced against every poll and every sleep, and a
//! poll that hangs is cut off when the current window runs out.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::app::config::RunnerConfig;
use crate::domain::{RunError, TimeoutWindow};
use crate::ports::{BackendHandle, BackendStatus, ExecutionBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollWindows {
    pub interval: Duration,
    pub start_timeout: Duration,
    pub finish_timeout: Duration,
}

impl From<&RunnerConfig> for PollWindows {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            interval: config.backend_poll_interval(),
            start_timeout: config.start_timeout(),
            finish_timeout: config.finish_timeout(),
        }
    }
}

pub async fn wait_for_completion(
    backend: &dyn ExecutionBackend,
    handle: &BackendHandle,
    stage: &str,
    windows: PollWindows,
    cancel: &CancellationToken,
) -> Result<(), RunError> {
    let submitted_at = Instant::now();
    let mut started_at: Option<Instant> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(RunError::Canceled);
        }

        let (window, limit, opened_at) = match started_at {
            None => (TimeoutWindow::Start, windows.start_timeout, submitted_at),
            Some(started) => (TimeoutWindow::Finish, windows.finish_timeout, started),
        };
        let remaining = limit.saturating_sub(opened_at.elapsed());

        let polled = tokio::select! {
            _ = cancel.cancelled() => return Err(RunError::Canceled),
            polled = tokio::time::timeout(remaining, backend.poll_status(handle)) => polled,
        };
        let status = match polled {
            Ok(result) => result.map_err(|e| RunError::backend(stage, e))?,
            Err(_) => {
                return Err(RunError::BackendTimeout {
                    stage: stage.to_string(),
                    window,
                    limit,
                });
            }
        };
        let now = Instant::now();

        match &status {
            BackendStatus::Succeeded => return Ok(()),
            BackendStatus::Failed(message) => {
                return Err(RunError::BackendFailure {
                    stage: stage.to_string(),
                    message: message.clone(),
                });
            }
            BackendStatus::NotStarted => {
                if now.duration_since(submitted_at) >= windows.start_timeout {
                    return Err(RunError::BackendTimeout {
                        stage: stage.to_string(),
                        window: TimeoutWindow::Start,
                        limit: windows.start_timeout,
                    });
                }
            }
            BackendStatus::Running => {
                let started = *started_at.get_or_insert(now);
                if now.duration_since(started) >= windows.finish_timeout {
                    return Err(RunError::BackendTimeout {
                        stage: stage.to_string(),
                        window: TimeoutWindow::Finish,
                        limit: windows.finish_timeout,
                    });
                }
            }
        }
        debug!(%handle, stage, ?status, "backend job not finished");

        tokio::select! {
            _ = cancel.cancelled() => return Err(RunError::Canceled),
            _ = tokio::time::sleep(windows.interval) => {}
        }
    }
}
