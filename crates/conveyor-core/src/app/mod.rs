//! App - the scheduling engine built from ports.
//!
//! # Components
//! - **EngineBuilder / Engine**: wiring and fail-fast validation
//! - **JobMonitor**: per-pipeline claim/launch/reap loop with bounded drain
//! - **RecoveryManager**: startup pass over orphaned `Processing` tasks
//! - **config**: tunables, JSON-loadable

pub mod builder;
pub mod config;
pub mod monitor;
pub mod recovery;
pub mod status;

pub use self::builder::{BuildError, Engine, EngineBuilder, SubmitError};
pub use self::config::{ConfigError, EngineConfig, MonitorConfig, RecoveryConfig, RunnerConfig};
pub use self::monitor::{JobMonitor, MonitorError};
pub use self::recovery::{RecoveryDecision, RecoveryManager, RecoveryReport};
pub use self::status::{EngineStatus, MonitorStatus};
