//! JobRunner trait and the runner boundary.
//!
//! - `JobRunner<R>`: one implementation per content type, typed on its
//!   request
//! - `DynRunner`: object-safe form stored in the registry
//! - `TypedRunner<R, X>`: type erasure plus the boundary every execution
//!   goes through. It decodes the payload, maps `RunError` to a final
//!   `JobStatus`, reports failures to the audit sink, and always runs
//!   cleanup afterwards.

use std::marker::PhantomData;

use async_trait::async_trait;
use tracing::{Instrument, info, info_span, warn};

use super::context::RunContext;
use super::request::PipelineRequest;
use crate::domain::{AuditAction, ContentType, ErrorKind, JobDetail, PipelineKind, RunError};

/// Executes one request of type `R`.
///
/// Returns the result document on success. Cancellation must be observed
/// cooperatively through `ctx` (`ensure_active`, `run_backend`).
///
/// # Usage
/// ```ignore
/// struct ArchiveRunner;
///
/// #[async_trait]
/// impl JobRunner<ArchiveRequest> for ArchiveRunner {
///     async fn execute(&self, request: ArchiveRequest, ctx: &RunContext) -> Result<Value, RunError> {
///         ctx.ensure_active()?;
///         let artifacts = ctx.run_backend(BackendOperation::Publish, request.source_path).await?;
///         Ok(json!({ "artifacts": artifacts.len() }))
///     }
/// }
/// ```
#[async_trait]
pub trait JobRunner<R: PipelineRequest>: Send + Sync {
    async fn execute(&self, request: R, ctx: &RunContext) -> Result<serde_json::Value, RunError>;
}

/// Object-safe runner, keyed by content type in `RunnerRegistry`.
#[async_trait]
pub trait DynRunner: Send + Sync {
    /// Run to completion. The returned detail has a finished status.
    async fn run(&self, detail: JobDetail, ctx: RunContext) -> JobDetail;

    fn content_type(&self) -> ContentType;

    fn kind(&self) -> PipelineKind;
}

/// Adapts a `JobRunner<R>` to `DynRunner`.
///
/// # Flow
/// 1. decode the stored payload into `R` (failure is a validation error)
/// 2. `execute` inside a `run` span keyed by task id
/// 3. map the result onto the detail; `RunError::kind() == None` is a cancel
/// 4. report failures and cancellations to the audit sink
/// 5. run cleanup whatever happened
pub struct TypedRunner<R: PipelineRequest, X: JobRunner<R>> {
    runner: X,
    _marker: PhantomData<fn() -> R>,
}

impl<R: PipelineRequest, X: JobRunner<R>> TypedRunner<R, X> {
    pub fn new(runner: X) -> Self {
        Self {
            runner,
            _marker: PhantomData,
        }
    }

    async fn execute_payload(
        &self,
        payload: serde_json::Value,
        ctx: &RunContext,
    ) -> Result<serde_json::Value, RunError> {
        let request: R = serde_json::from_value(payload).map_err(|e| {
            RunError::validation(format!("malformed {} request: {e}", R::CONTENT_TYPE))
        })?;
        ctx.ensure_active()?;
        self.runner.execute(request, ctx).await
    }
}

#[async_trait]
impl<R: PipelineRequest, X: JobRunner<R>> DynRunner for TypedRunner<R, X> {
    async fn run(&self, mut detail: JobDetail, ctx: RunContext) -> JobDetail {
        let span = info_span!(
            "run",
            task_id = %detail.id,
            content_type = R::CONTENT_TYPE,
            retry = detail.request.retry_count
        );
        async {
            detail.mark_started(ctx.now());
            let result = self
                .execute_payload(detail.request.payload.clone(), &ctx)
                .await;

            match result {
                Ok(output) => {
                    detail.succeed(output, ctx.now());
                    info!("execution succeeded");
                }
                Err(err) => match err.kind() {
                    None => {
                        detail.cancel(ctx.now());
                        info!("execution canceled");
                        ctx.audit(AuditAction::ExecutionCanceled, err.to_string())
                            .await;
                    }
                    Some(kind) => {
                        let message = err.to_string();
                        warn!(?kind, error = %message, "execution failed");
                        let action = if kind == ErrorKind::Validation {
                            AuditAction::ValidationFailed
                        } else {
                            AuditAction::ExecutionFailed
                        };
                        ctx.audit(action, message.clone()).await;
                        detail.fail(kind, message, ctx.now());
                    }
                },
            }

            // Status is final at this point; cleanup only logs.
            ctx.cleanup().await;
            detail
        }
        .instrument(span)
        .await
    }

    fn content_type(&self) -> ContentType {
        R::content_type()
    }

    fn kind(&self) -> PipelineKind {
        R::KIND
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Small runners and a context factory shared by unit tests.

    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::app::config::RunnerConfig;
    use crate::impls::{InMemoryTaskStore, RecordingAuditSink, SimulatedBackend};
    use crate::ports::{StoreProgress, SystemClock};
    use crate::typed::context::RunServices;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct EchoRequest {
        pub content_id: String,
        #[serde(default)]
        pub fail_with: Option<String>,
        #[serde(default)]
        pub sleep_ms: u64,
    }

    impl PipelineRequest for EchoRequest {
        const CONTENT_TYPE: &'static str = "test.echo.v1";
        const KIND: PipelineKind = PipelineKind::Publication;

        fn content_id(&self) -> &str {
            &self.content_id
        }
    }

    /// Echoes its content id after an optional cancellation-aware sleep.
    pub struct EchoRunner;

    #[async_trait]
    impl JobRunner<EchoRequest> for EchoRunner {
        async fn execute(
            &self,
            request: EchoRequest,
            ctx: &RunContext,
        ) -> Result<serde_json::Value, RunError> {
            if request.sleep_ms > 0 {
                tokio::select! {
                    _ = ctx.cancel_token().cancelled() => return Err(RunError::Canceled),
                    _ = tokio::time::sleep(Duration::from_millis(request.sleep_ms)) => {}
                }
            }
            match request.fail_with {
                Some(message) => Err(RunError::validation(message)),
                None => Ok(serde_json::json!({ "echo": request.content_id })),
            }
        }
    }

    pub fn services(audit: Arc<RecordingAuditSink>) -> RunServices {
        let base = std::env::temp_dir().join(format!("conveyor-run-{}", ulid::Ulid::new()));
        RunServices {
            backend: Arc::new(SimulatedBackend::new()),
            audit,
            progress: Arc::new(StoreProgress::new(Arc::new(InMemoryTaskStore::new()))),
            clock: Arc::new(SystemClock),
            settings: RunnerConfig::default(),
            workspace_root: base.join("work"),
            publish_root: base.join("published"),
        }
    }

    pub fn scope() -> CancellationToken {
        CancellationToken::new()
    }

    pub fn workspace_of(services: &RunServices, detail: &JobDetail) -> PathBuf {
        services.workspace_root.join(detail.id.to_string())
    }
}
