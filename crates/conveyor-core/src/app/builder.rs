//! EngineBuilder - wiring and startup validation.
//!
//! Collects the adapters and runners, checks that every expected content
//! type has a runner (fail-fast), and builds one `JobMonitor` per pipeline
//! kind that has runners.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::config::{ConfigError, EngineConfig};
use super::monitor::{JobMonitor, MonitorError};
use super::recovery::RecoveryManager;
use super::status::{EngineStatus, MonitorStatus};
use crate::domain::{PipelineKind, TaskId, TaskRecord};
use crate::impls::TracingAuditSink;
use crate::pipelines::{
    PipelineProfile, PublicationRequest, PublicationRunner, ReductionRequest, ReductionRunner,
};
use crate::ports::{
    AuditSink, Clock, ExecutionBackend, StoreError, StoreProgress, SystemClock, TaskStore,
};
use crate::typed::{JobRunner, PipelineRequest, RegistryError, RunServices, RunnerRegistry};

/// Assembles an `Engine` from adapters and runners.
///
/// # Usage
/// ```ignore
/// let engine = EngineBuilder::new(config)
///     .store(store)
///     .backend(backend)
///     .with_document_pipelines()?
///     .build()?;
/// engine.run(shutdown).await;
/// ```
///
/// # Fail-fast
/// - `expect_content_types` records what must be runnable
/// - `build` checks "expected is a subset of registered" and validates the
///   configuration before any monitor exists
/// - a missing store or backend is a `BuildError`, never a later panic
pub struct EngineBuilder {
    config: EngineConfig,
    registry: RunnerRegistry,
    expected: Option<Vec<String>>,
    store: Option<Arc<dyn TaskStore>>,
    backend: Option<Arc<dyn ExecutionBackend>>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    recovery_lock: Option<Arc<Mutex<()>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing content types: {0:?}. These content types were expected but not registered.")]
    MissingContentTypes(Vec<String>),

    #[error("no task store configured")]
    MissingStore,

    #[error("no execution backend configured")]
    MissingBackend,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("no runner registered for content type '{0}'")]
    Unregistered(String),

    #[error("request could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: RunnerRegistry::new(),
            expected: None,
            store: None,
            backend: None,
            audit: Arc::new(TracingAuditSink),
            clock: Arc::new(SystemClock),
            recovery_lock: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Defaults to `TracingAuditSink`.
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Serialize recovery on `lock` instead of the process-wide lock.
    pub fn recovery_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.recovery_lock = Some(lock);
        self
    }

    pub fn register<R: PipelineRequest, X: JobRunner<R> + 'static>(
        mut self,
        runner: X,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<R, X>(runner)?;
        Ok(self)
    }

    /// Register the publication and reduction runners and expect both.
    pub fn with_document_pipelines(self) -> Result<Self, RegistryError> {
        let builder = self
            .register::<PublicationRequest, _>(PublicationRunner)?
            .register::<ReductionRequest, _>(ReductionRunner)?;
        Ok(builder.expect_content_types(&[
            PublicationRequest::CONTENT_TYPE,
            ReductionRequest::CONTENT_TYPE,
        ]))
    }

    /// Content types that must have a runner when `build` runs.
    pub fn expect_content_types(mut self, content_types: &[&str]) -> Self {
        let expected = self.expected.get_or_insert_with(Vec::new);
        for &content_type in content_types {
            if !expected.iter().any(|e| e == content_type) {
                expected.push(content_type.to_string());
            }
        }
        self
    }

    /// Validate and wire the engine.
    ///
    /// # Validation
    /// - `EngineConfig::validate`
    /// - every expected content type is registered, otherwise
    ///   `BuildError::MissingContentTypes` lists the missing ones
    ///
    /// # Example
    /// ```ignore
    /// let engine = builder.build()?;
    /// ```
    pub fn build(self) -> Result<Engine, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected {
            let registered = self.registry.registered_types();
            let missing: Vec<String> = expected
                .iter()
                .filter(|x| !registered.iter().any(|r| r.as_str() == x.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingContentTypes(missing));
            }
        }

        let store = self.store.ok_or(BuildError::MissingStore)?;
        let backend = self.backend.ok_or(BuildError::MissingBackend)?;
        let services = RunServices {
            backend,
            audit: self.audit,
            progress: Arc::new(StoreProgress::new(Arc::clone(&store))),
            clock: self.clock,
            settings: self.config.runner.clone(),
            workspace_root: self.config.workspace_root.clone(),
            publish_root: self.config.publish_root.clone(),
        };
        let registry = Arc::new(self.registry);

        let mut monitors = Vec::new();
        for kind in [PipelineKind::Publication, PipelineKind::Reduction] {
            let content_types = registry.content_types_for(kind);
            if content_types.is_empty() {
                continue;
            }
            let config = self.config.monitor(kind).clone();
            let profile = PipelineProfile::for_kind(kind, &config, content_types);
            let mut monitor = JobMonitor::new(
                profile,
                config,
                Arc::clone(&store),
                Arc::clone(&registry),
                services.clone(),
            );
            if self.config.recovery.enabled {
                let max_retries = self.config.recovery.max_retries;
                let recovery = match &self.recovery_lock {
                    Some(lock) => {
                        RecoveryManager::with_lock(Arc::clone(&store), max_retries, Arc::clone(lock))
                    }
                    None => RecoveryManager::new(Arc::clone(&store), max_retries),
                };
                monitor = monitor.with_recovery(recovery);
            }
            monitors.push(Arc::new(monitor));
        }

        Ok(Engine {
            monitors,
            store,
            registry,
        })
    }
}

/// A built engine: one monitor per pipeline kind with runners.
pub struct Engine {
    monitors: Vec<Arc<JobMonitor>>,
    store: Arc<dyn TaskStore>,
    registry: Arc<RunnerRegistry>,
}

impl Engine {
    pub fn monitor(&self, kind: PipelineKind) -> Option<&JobMonitor> {
        self.monitors
            .iter()
            .find(|m| m.kind() == kind)
            .map(|m| m.as_ref())
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    /// Enqueue `request`, optionally as a sub-task of `parent`.
    pub async fn submit<R: PipelineRequest>(
        &self,
        request: &R,
        parent: Option<TaskId>,
    ) -> Result<TaskRecord, SubmitError> {
        if self.registry.get(&R::content_type()).is_none() {
            return Err(SubmitError::Unregistered(R::CONTENT_TYPE.to_string()));
        }
        let mut task = request.to_new_task()?;
        if let Some(parent) = parent {
            task = task.with_parent(parent);
        }
        let record = self.store.enqueue(task).await?;
        info!(task_id = %record.id, content_type = R::CONTENT_TYPE, content_id = %record.content_id, "task submitted");
        Ok(record)
    }

    pub async fn status(&self) -> Result<EngineStatus, StoreError> {
        let queue = self.store.counts().await?;
        let monitors = self
            .monitors
            .iter()
            .map(|m| MonitorStatus {
                kind: m.kind(),
                state: m.state(),
                max_concurrent_runners: m.config().max_concurrent_runners,
            })
            .collect();
        Ok(EngineStatus { monitors, queue })
    }

    /// Run every monitor until `shutdown` fires and all have drained.
    ///
    /// Returns the first non-cancel error a monitor reported, otherwise
    /// `MonitorError::Canceled`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), MonitorError> {
        let mut set = JoinSet::new();
        for monitor in &self.monitors {
            let monitor = Arc::clone(monitor);
            let shutdown = shutdown.clone();
            set.spawn(async move { (monitor.kind(), monitor.run(shutdown).await) });
        }

        let mut result = Err(MonitorError::Canceled);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) | Ok((_, Err(MonitorError::Canceled))) => {}
                Ok((kind, Err(e))) => {
                    error!(monitor = %kind, error = %e, "monitor exited");
                    result = Err(e);
                }
                Err(e) => error!(error = %e, "monitor task panicked"),
            }
        }
        result
    }
}
