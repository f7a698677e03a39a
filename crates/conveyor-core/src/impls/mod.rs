//! Impls - in-process adapters for the ports.
//!
//! # Included
//! - **InMemoryTaskStore**: queue for tests and the demo binary
//! - **SimulatedBackend**: scripted document backend
//! - **TracingAuditSink** / **RecordingAuditSink** / **NoopAuditSink**
//!
//! # Production adapters
//! - `conveyor-pg`: PgTaskStore

pub mod audit;
pub mod inmem_store;
pub mod sim_backend;

pub use self::audit::{NoopAuditSink, RecordingAuditSink, TracingAuditSink};
pub use self::inmem_store::InMemoryTaskStore;
pub use self::sim_backend::{SimOutcome, SimScript, SimulatedBackend};
