//! Typed - runner API.
//!
//! # Two layers
//! - **Typed**: `PipelineRequest`, `JobRunner<R>` - the request type fixes
//!   the content type at compile time
//! - **Dyn**: `DynRunner` - object-safe, stored in `RunnerRegistry`
//!
//! `RunContext` is the only handle a runner gets on the outside world.

pub mod context;
pub mod polling;
pub mod registry;
pub mod request;
pub mod runner;
pub mod workspace;

pub use self::context::{RunContext, RunServices};
pub use self::polling::{PollWindows, wait_for_completion};
pub use self::registry::{RegistryError, RunnerRegistry};
pub use self::request::PipelineRequest;
pub use self::runner::{DynRunner, JobRunner, TypedRunner};
pub use self::workspace::{Distributed, WorkingArea, check_content_id, distribute, sha256_hex};
