//! conveyor-pg
//!
//! Postgres adapter for `conveyor_core::ports::TaskStore`.

mod store;

pub use store::PgTaskStore;
