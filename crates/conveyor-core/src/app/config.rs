//! Engine configuration.
//!
//! Every struct deserializes with `#[serde(default)]`, so a config file only
//! names what it overrides. Durations are plain integer fields
//! (`*_ms` / `*_secs`) with accessor methods returning `Duration`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::PipelineKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{monitor} monitor: max_concurrent_runners must be at least 1")]
    ZeroConcurrency { monitor: PipelineKind },

    #[error("{monitor} monitor: poll_interval_ms must be at least 1")]
    ZeroPollInterval { monitor: PipelineKind },

    #[error("runner: backend_poll_interval_ms must be at least 1")]
    ZeroBackendPoll,

    #[error("invalid config document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Settings of one `JobMonitor` instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Position of this instance among monitors started together. Scales
    /// the launch stagger.
    pub instance_index: u32,
    pub poll_interval_ms: u64,
    pub max_concurrent_runners: usize,
    /// `StopWaitTimeSeconds` before sqrt scaling.
    pub stop_wait_base_secs: u64,
    /// Drain polls at `stop_wait / stop_wait_poll_divisor`.
    pub stop_wait_poll_divisor: u32,
    pub launch_stagger_ms: u64,
    /// `TaskAgeBeforeExecution`.
    pub task_age_before_execution_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            instance_index: 0,
            poll_interval_ms: 1_000,
            max_concurrent_runners: 2,
            stop_wait_base_secs: 180,
            stop_wait_poll_divisor: 10,
            launch_stagger_ms: 250,
            task_age_before_execution_secs: 0,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_wait(&self) -> Duration {
        stop_wait_time(
            Duration::from_secs(self.stop_wait_base_secs),
            self.max_concurrent_runners,
        )
    }

    /// Drain polling granularity. Never zero.
    pub fn stop_wait_poll(&self) -> Duration {
        let step = self.stop_wait() / self.stop_wait_poll_divisor.max(1);
        step.max(Duration::from_millis(1))
    }

    /// Delay between consecutive launches of one cycle.
    pub fn launch_stagger(&self) -> Duration {
        Duration::from_millis(self.launch_stagger_ms.saturating_mul(u64::from(self.instance_index)))
    }

    pub fn task_age(&self) -> Duration {
        Duration::from_secs(self.task_age_before_execution_secs)
    }

    fn validate(&self, monitor: PipelineKind) -> Result<(), ConfigError> {
        if self.max_concurrent_runners == 0 {
            return Err(ConfigError::ZeroConcurrency { monitor });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval { monitor });
        }
        Ok(())
    }
}

/// Settings shared by every runner execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub backend_poll_interval_ms: u64,
    /// Longest a backend job may stay `NotStarted`.
    pub start_timeout_secs: u64,
    /// Longest a started backend job may take to finish.
    pub finish_timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            backend_poll_interval_ms: 250,
            start_timeout_secs: 5 * 60,
            finish_timeout_secs: 30 * 60,
        }
    }
}

impl RunnerConfig {
    pub fn backend_poll_interval(&self) -> Duration {
        Duration::from_millis(self.backend_poll_interval_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn finish_timeout(&self) -> Duration {
        Duration::from_secs(self.finish_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub max_retries: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub publication: MonitorConfig,
    pub reduction: MonitorConfig,
    pub runner: RunnerConfig,
    pub recovery: RecoveryConfig,
    /// Parent of the per-task working areas.
    pub workspace_root: PathBuf,
    /// Where distributed artifacts land (`<publish_root>/<content_id>/<task_id>/`).
    pub publish_root: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("conveyor");
        Self {
            publication: MonitorConfig::default(),
            reduction: MonitorConfig {
                instance_index: 1,
                ..MonitorConfig::default()
            },
            runner: RunnerConfig::default(),
            recovery: RecoveryConfig::default(),
            workspace_root: base.join("work"),
            publish_root: base.join("published"),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.publication.validate(PipelineKind::Publication)?;
        self.reduction.validate(PipelineKind::Reduction)?;
        if self.runner.backend_poll_interval_ms == 0 {
            return Err(ConfigError::ZeroBackendPoll);
        }
        Ok(())
    }

    pub fn monitor(&self, kind: PipelineKind) -> &MonitorConfig {
        match kind {
            PipelineKind::Publication => &self.publication,
            PipelineKind::Reduction => &self.reduction,
        }
    }
}

/// `base * ceil(sqrt(max_concurrent_runners))`.
pub fn stop_wait_time(base: Duration, max_concurrent_runners: usize) -> Duration {
    let factor = u32::try_from(ceil_sqrt(max_concurrent_runners.max(1))).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

fn ceil_sqrt(n: usize) -> usize {
    let mut root = (n as f64).sqrt() as usize;
    while root * root > n {
        root -= 1;
    }
    while root * root < n {
        root += 1;
    }
    root
}
