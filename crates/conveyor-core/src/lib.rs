//! conveyor-core
//!
//! Job scheduling and execution engine for document pipelines.
//!
//! # Modules
//! - **domain**: ids, task records, statuses, job detail, outcomes, errors
//! - **ports**: TaskStore, ExecutionBackend, AuditSink, ProgressSink, Clock
//! - **typed**: PipelineRequest / JobRunner, registry, run context
//! - **pipelines**: publication and reduction runners and their profiles
//! - **app**: JobMonitor, RecoveryManager, EngineBuilder, config
//! - **impls**: in-memory store, simulated backend, audit sinks

pub mod app;
pub mod domain;
pub mod impls;
pub mod pipelines;
pub mod ports;
pub mod typed;
