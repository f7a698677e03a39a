#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::app::{JobMonitor, MonitorConfig, RunnerConfig};
use conveyor_core::domain::{PipelineKind, RunError};
use conveyor_core::impls::{InMemoryTaskStore, RecordingAuditSink, SimulatedBackend};
use conveyor_core::pipelines::PipelineProfile;
use conveyor_core::ports::{
    ExecutionBackend, QueueCounts, StoreProgress, SystemClock, TaskStore,
};
use conveyor_core::typed::{JobRunner, PipelineRequest, RunContext, RunServices, RunnerRegistry};
use serde::{Deserialize, Serialize};

pub fn temp_dir(test_name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "conveyor_{test_name}_{}_{}",
        std::process::id(),
        ulid::Ulid::new()
    ));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Sleeps for `sleep_ms`, ignoring cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepRequest {
    pub content_id: String,
    pub sleep_ms: u64,
}

impl PipelineRequest for SleepRequest {
    const CONTENT_TYPE: &'static str = "test.sleep.v1";
    const KIND: PipelineKind = PipelineKind::Publication;

    fn content_id(&self) -> &str {
        &self.content_id
    }
}

pub struct StubbornRunner;

#[async_trait]
impl JobRunner<SleepRequest> for StubbornRunner {
    async fn execute(
        &self,
        request: SleepRequest,
        _ctx: &RunContext,
    ) -> Result<serde_json::Value, RunError> {
        tokio::time::sleep(Duration::from_millis(request.sleep_ms)).await;
        Ok(serde_json::json!({ "slept_ms": request.sleep_ms }))
    }
}

pub fn services(
    store: Arc<InMemoryTaskStore>,
    backend: Arc<dyn ExecutionBackend>,
    settings: RunnerConfig,
    dir: &std::path::Path,
) -> RunServices {
    RunServices {
        backend,
        audit: Arc::new(RecordingAuditSink::new()),
        progress: Arc::new(StoreProgress::new(store)),
        clock: Arc::new(SystemClock),
        settings,
        workspace_root: dir.join("work"),
        publish_root: dir.join("published"),
    }
}

/// Publication monitor serving only `SleepRequest`.
pub fn sleep_monitor(store: Arc<InMemoryTaskStore>, config: MonitorConfig) -> JobMonitor {
    let mut registry = RunnerRegistry::new();
    registry
        .register::<SleepRequest, _>(StubbornRunner)
        .expect("register");
    let kind = PipelineKind::Publication;
    let profile = PipelineProfile::for_kind(kind, &config, registry.content_types_for(kind));
    let services = services(
        store.clone(),
        Arc::new(SimulatedBackend::new()),
        RunnerConfig::default(),
        &temp_dir("sleep_monitor"),
    );
    JobMonitor::new(profile, config, store, Arc::new(registry), services)
}

pub async fn wait_for(
    store: &dyn TaskStore,
    done: impl Fn(&QueueCounts) -> bool,
) -> QueueCounts {
    for _ in 0..1000 {
        let counts = store.counts().await.expect("counts");
        if done(&counts) {
            return counts;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "condition not reached: {:?}",
        store.counts().await.expect("counts")
    );
}
