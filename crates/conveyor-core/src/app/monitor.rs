//! JobMonitor - claims tasks of one pipeline and runs them, bounded.
//!
//! # Loop (every `poll_interval` while `Running`)
//! 1. reap: persist the outcome of every finished runner, drop it from the
//!    tracking set
//! 2. claim & launch: fill free capacity (`max_concurrent_runners` minus
//!    tracked) with `claim_ready`, spawn one runner per task with its own
//!    cancellation scope
//! 3. sleep
//!
//! # Drain (shutdown token canceled)
//! Cancel every scope, then reap at `stop_wait / divisor` granularity until
//! the tracking set is empty or `stop_wait` elapsed. Runners still running
//! after that are logged and detached; their tasks stay `Processing` for
//! the next startup's recovery. `run` then returns `MonitorError::Canceled`.
//!
//! The tracking set lives on `run`'s stack. Runners never touch it.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MonitorConfig;
use super::recovery::RecoveryManager;
use crate::domain::{ErrorKind, JobDetail, MonitorState, PipelineKind, TaskId, TaskRecord};
use crate::pipelines::PipelineProfile;
use crate::ports::{PersistResult, TaskStore};
use crate::typed::{RunServices, RunnerRegistry};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    /// The shutdown token fired; draining finished.
    #[error("monitor canceled")]
    Canceled,

    #[error("monitor already started")]
    AlreadyStarted,
}

struct TrackingItem {
    task_id: TaskId,
    /// Snapshot at launch; becomes the outcome if the runner panics.
    detail: JobDetail,
    scope: CancellationToken,
    handle: JoinHandle<JobDetail>,
}

/// Bounded executor for one pipeline kind.
///
/// # State transitions
/// `Idle -> Running -> Draining -> Stopped`. Only `Idle -> Running` is
/// decided by the caller (`run`); a monitor is single-use.
///
/// # Usage
/// ```ignore
/// let recovery = RecoveryManager::new(store.clone(), 3);
/// let monitor = Arc::new(
///     JobMonitor::new(profile, config, store, registry, services).with_recovery(recovery),
/// );
/// let handle = tokio::spawn({
///     let monitor = monitor.clone();
///     async move { monitor.run(shutdown).await }
/// });
/// ```
pub struct JobMonitor {
    profile: PipelineProfile,
    config: MonitorConfig,
    store: Arc<dyn TaskStore>,
    registry: Arc<RunnerRegistry>,
    services: RunServices,
    recovery: Option<RecoveryManager>,
    state: watch::Sender<MonitorState>,
}

impl JobMonitor {
    pub fn new(
        profile: PipelineProfile,
        config: MonitorConfig,
        store: Arc<dyn TaskStore>,
        registry: Arc<RunnerRegistry>,
        services: RunServices,
    ) -> Self {
        let (state, _) = watch::channel(MonitorState::Idle);
        Self {
            profile,
            config,
            store,
            registry,
            services,
            recovery: None,
            state,
        }
    }

    /// Run a recovery pass before the first cycle.
    pub fn with_recovery(mut self, recovery: RecoveryManager) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn kind(&self) -> PipelineKind {
        self.profile.kind
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<MonitorState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` fires, then drain.
    ///
    /// Always ends in `Err`: `Canceled` after a drain, `AlreadyStarted` when
    /// called twice.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), MonitorError> {
        let started = self.state.send_if_modified(|state| {
            if *state == MonitorState::Idle {
                *state = MonitorState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(MonitorError::AlreadyStarted);
        }
        let monitor = self.profile.kind;
        info!(
            %monitor,
            max_concurrent = self.config.max_concurrent_runners,
            poll_ms = self.config.poll_interval_ms,
            "monitor started"
        );

        if let Some(recovery) = &self.recovery {
            match recovery.recover(&self.profile).await {
                Ok(report) => info!(%monitor, ?report, "recovery pass finished"),
                Err(e) => error!(%monitor, error = %e, "recovery pass failed"),
            }
        }

        let mut tracking: Vec<TrackingItem> = Vec::new();
        while !shutdown.is_cancelled() {
            self.reap(&mut tracking).await;
            self.claim_and_launch(&mut tracking, &shutdown).await;
            debug_assert!(tracking.len() <= self.config.max_concurrent_runners);

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = sleep(self.config.poll_interval()) => {}
            }
        }

        self.drain(tracking).await;
        self.state.send_replace(MonitorState::Stopped);
        info!(%monitor, "monitor stopped");
        Err(MonitorError::Canceled)
    }

    async fn reap(&self, tracking: &mut Vec<TrackingItem>) {
        let (finished, pending): (Vec<_>, Vec<_>) = std::mem::take(tracking)
            .into_iter()
            .partition(|item| item.handle.is_finished());
        *tracking = pending;
        for item in finished {
            self.settle(item).await;
        }
    }

    async fn settle(&self, item: TrackingItem) {
        let detail = match item.handle.await {
            Ok(detail) => detail,
            Err(e) => {
                error!(task_id = %item.task_id, error = %e, "runner task panicked");
                let mut detail = item.detail;
                detail.fail(
                    ErrorKind::RunnerPanic,
                    format!("runner panicked: {e}"),
                    self.services.clock.now(),
                );
                detail
            }
        };
        self.persist(item.task_id, detail).await;
    }

    async fn persist(&self, task_id: TaskId, detail: JobDetail) {
        let (status, outcome) = detail.into_outcome();
        match self.store.persist_outcome(task_id, status, outcome).await {
            Ok(PersistResult::Applied) => info!(%task_id, %status, "outcome persisted"),
            Ok(PersistResult::DiscardedCanceled) => {
                info!(%task_id, %status, "task was canceled while running; outcome discarded")
            }
            Err(e) => error!(%task_id, error = %e, "outcome not persisted; left for recovery"),
        }
    }

    async fn claim_and_launch(
        &self,
        tracking: &mut Vec<TrackingItem>,
        shutdown: &CancellationToken,
    ) {
        let capacity = self
            .config
            .max_concurrent_runners
            .saturating_sub(tracking.len());
        if capacity == 0 {
            return;
        }

        let claimed = match self.store.claim_ready(capacity, &self.profile.claim).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(monitor = %self.profile.kind, error = %e, "claim failed; retrying next cycle");
                return;
            }
        };
        if claimed.is_empty() {
            return;
        }
        debug!(monitor = %self.profile.kind, claimed = claimed.len(), capacity, "claimed tasks");

        let stagger = self.config.launch_stagger();
        for task in claimed {
            if !stagger.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = sleep(stagger) => {}
                }
            }
            if let Some(item) = self.launch(task).await {
                tracking.push(item);
            }
        }
    }

    async fn launch(&self, task: TaskRecord) -> Option<TrackingItem> {
        let detail = JobDetail::from_task(&task);
        let Some(runner) = self.registry.get(&task.content_type) else {
            error!(task_id = %task.id, content_type = %task.content_type, "no runner registered");
            let mut failed = detail;
            failed.fail(
                ErrorKind::Validation,
                format!("no runner registered for content type {}", task.content_type),
                self.services.clock.now(),
            );
            self.persist(task.id, failed).await;
            return None;
        };

        let scope = CancellationToken::new();
        let ctx = self.services.context_for(&detail, scope.clone());
        let handle = tokio::spawn({
            let detail = detail.clone();
            async move { runner.run(detail, ctx).await }
        });
        info!(
            task_id = %task.id,
            content_type = %task.content_type,
            retry = detail.request.retry_count,
            "runner launched"
        );
        Some(TrackingItem {
            task_id: task.id,
            detail,
            scope,
            handle,
        })
    }

    async fn drain(&self, mut tracking: Vec<TrackingItem>) {
        self.state.send_replace(MonitorState::Draining);
        let budget = self.config.stop_wait();
        let step = self.config.stop_wait_poll();
        info!(
            monitor = %self.profile.kind,
            in_flight = tracking.len(),
            budget_ms = budget.as_millis() as u64,
            "draining"
        );

        for item in &tracking {
            item.scope.cancel();
        }

        let deadline = Instant::now() + budget;
        loop {
            self.reap(&mut tracking).await;
            if tracking.is_empty() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(step.min(deadline - now)).await;
        }

        for item in &tracking {
            warn!(task_id = %item.task_id, "runner still in flight after stop wait; abandoned, task left Processing");
        }
        // Dropping the handles detaches the runner tasks.
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::app::config::RunnerConfig;
    use crate::domain::{ContentType, NewTask, TaskStatus};
    use crate::impls::{InMemoryTaskStore, RecordingAuditSink, SimulatedBackend};
    use crate::pipelines::{ParentPolicy, SubTaskPolicy};
    use crate::ports::{ClaimFilter, OrphanFilter, QueueCounts, StoreProgress, SystemClock};
    use crate::typed::PipelineRequest;
    use crate::typed::runner::testing::{EchoRequest, EchoRunner};

    struct Harness {
        store: Arc<InMemoryTaskStore>,
        monitor: Arc<JobMonitor>,
    }

    fn harness(max: usize) -> Harness {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut registry = RunnerRegistry::new();
        registry.register::<EchoRequest, _>(EchoRunner).unwrap();
        let base = std::env::temp_dir().join(format!("conveyor-mon-{}", ulid::Ulid::new()));
        let services = RunServices {
            backend: Arc::new(SimulatedBackend::new()),
            audit: Arc::new(RecordingAuditSink::new()),
            progress: Arc::new(StoreProgress::new(store.clone())),
            clock: Arc::new(SystemClock),
            settings: RunnerConfig::default(),
            workspace_root: base.join("work"),
            publish_root: base.join("published"),
        };
        let kind = PipelineKind::Publication;
        let profile = PipelineProfile {
            kind,
            claim: ClaimFilter::new(kind),
            orphans: OrphanFilter::new(kind),
            sub_tasks: SubTaskPolicy::Ignore,
            parent: ParentPolicy::Independent,
        };
        let config = MonitorConfig {
            poll_interval_ms: 5,
            max_concurrent_runners: max,
            stop_wait_base_secs: 1,
            launch_stagger_ms: 0,
            ..MonitorConfig::default()
        };
        let monitor = JobMonitor::new(profile, config, store.clone(), Arc::new(registry), services);
        Harness {
            store,
            monitor: Arc::new(monitor),
        }
    }

    async fn enqueue_echo(store: &InMemoryTaskStore, content_id: &str, sleep_ms: u64) -> TaskId {
        let request = EchoRequest {
            content_id: content_id.to_string(),
            fail_with: None,
            sleep_ms,
        };
        store.enqueue(request.to_new_task().unwrap()).await.unwrap().id
    }

    async fn wait_for(store: &InMemoryTaskStore, done: impl Fn(&QueueCounts) -> bool) -> QueueCounts {
        for _ in 0..500 {
            let counts = store.counts().await.unwrap();
            if done(&counts) {
                return counts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached: {:?}", store.counts().await.unwrap());
    }

    #[tokio::test]
    async fn runs_every_queued_task_to_success() {
        let h = harness(2);
        for i in 0..5 {
            enqueue_echo(&h.store, &format!("doc-{i}"), 0).await;
        }
        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let monitor = h.monitor.clone();
            let shutdown = shutdown.clone();
            async move { monitor.run(shutdown).await }
        });

        wait_for(&h.store, |c| c.success == 5).await;
        assert_eq!(h.monitor.state(), MonitorState::Running);

        shutdown.cancel();
        assert_eq!(run.await.unwrap(), Err(MonitorError::Canceled));
        assert_eq!(h.monitor.state(), MonitorState::Stopped);
    }

    #[tokio::test]
    async fn never_tracks_more_than_max_runners() {
        let h = harness(2);
        for i in 0..6 {
            enqueue_echo(&h.store, &format!("doc-{i}"), 30).await;
        }
        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let monitor = h.monitor.clone();
            let shutdown = shutdown.clone();
            async move { monitor.run(shutdown).await }
        });

        for _ in 0..100 {
            let counts = h.store.counts().await.unwrap();
            assert!(counts.processing <= 2, "{counts:?}");
            if counts.success == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        wait_for(&h.store, |c| c.success == 6).await;
        shutdown.cancel();
        run.await.unwrap().unwrap_err();
    }

    #[tokio::test]
    async fn unknown_content_type_fails_the_task() {
        let h = harness(1);
        let task = NewTask::new(
            PipelineKind::Publication,
            ContentType::new("unknown.v1"),
            "doc-1",
            json!({}),
        );
        let id = h.store.enqueue(task).await.unwrap().id;
        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let monitor = h.monitor.clone();
            let shutdown = shutdown.clone();
            async move { monitor.run(shutdown).await }
        });

        wait_for(&h.store, |c| c.error == 1).await;
        let record = h.store.get(id).await.unwrap().unwrap();
        let failure = record.outcome.and_then(|o| o.failure).unwrap();
        assert_eq!(failure.kind, ErrorKind::Validation);
        assert!(failure.message.contains("unknown.v1"));

        shutdown.cancel();
        run.await.unwrap().unwrap_err();
    }

    #[tokio::test]
    async fn drain_cancels_cooperative_runners() {
        let h = harness(2);
        let a = enqueue_echo(&h.store, "doc-a", 60_000).await;
        let b = enqueue_echo(&h.store, "doc-b", 60_000).await;
        let shutdown = CancellationToken::new();
        let mut states = h.monitor.subscribe_state();
        let run = tokio::spawn({
            let monitor = h.monitor.clone();
            let shutdown = shutdown.clone();
            async move { monitor.run(shutdown).await }
        });

        wait_for(&h.store, |c| c.processing == 2).await;
        shutdown.cancel();
        states.wait_for(|s| *s == MonitorState::Stopped).await.unwrap();
        assert_eq!(run.await.unwrap(), Err(MonitorError::Canceled));

        for id in [a, b] {
            let record = h.store.get(id).await.unwrap().unwrap();
            assert_eq!(record.status, TaskStatus::Canceled);
        }
    }

    #[tokio::test]
    async fn admin_cancel_wins_over_runner_result() {
        let h = harness(1);
        let id = enqueue_echo(&h.store, "doc-a", 50).await;
        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let monitor = h.monitor.clone();
            let shutdown = shutdown.clone();
            async move { monitor.run(shutdown).await }
        });

        wait_for(&h.store, |c| c.processing == 1).await;
        h.store.cancel(id, "canceled by operator").await.unwrap();
        // the runner still finishes; its success must not overwrite the cancel
        tokio::time::sleep(Duration::from_millis(150)).await;

        let record = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Canceled);
        shutdown.cancel();
        run.await.unwrap().unwrap_err();
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let h = harness(1);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert_eq!(h.monitor.run(shutdown.clone()).await, Err(MonitorError::Canceled));
        assert_eq!(h.monitor.run(shutdown).await, Err(MonitorError::AlreadyStarted));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runs_start_exactly_once() {
        let h = harness(1);
        let shutdown = CancellationToken::new();
        let runs: Vec<_> = (0..4)
            .map(|_| {
                let monitor = h.monitor.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { monitor.run(shutdown).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let mut results = Vec::new();
        for run in runs {
            results.push(run.await.unwrap());
        }
        let canceled = results
            .iter()
            .filter(|r| **r == Err(MonitorError::Canceled))
            .count();
        let rejected = results
            .iter()
            .filter(|r| **r == Err(MonitorError::AlreadyStarted))
            .count();
        assert_eq!((canceled, rejected), (1, 3));
    }
}
