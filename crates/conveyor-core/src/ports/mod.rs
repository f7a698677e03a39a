//! Ports - traits at every collaborator seam.
//!
//! Each trait hides an external system (relational store, document backend,
//! audit log, wall clock). Production adapters live outside this module;
//! `impls` has the in-memory and simulated ones. Everything is injected
//! through constructors.

pub mod audit_sink;
pub mod backend;
pub mod clock;
pub mod id_generator;
pub mod progress;
pub mod task_store;

pub use self::audit_sink::{AuditError, AuditSink};
pub use self::backend::{
    BackendArtifact, BackendError, BackendHandle, BackendJob, BackendOperation, BackendStatus,
    ExecutionBackend,
};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::progress::{ProgressSink, StoreProgress};
pub use self::task_store::{
    ClaimFilter, OrphanFilter, PersistResult, QueueCounts, StoreError, TaskStore,
};
