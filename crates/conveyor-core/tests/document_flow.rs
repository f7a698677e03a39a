//! Publication -> reduction through a built engine.

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use conveyor_core::app::{
    Engine, EngineBuilder, EngineConfig, MonitorConfig, MonitorError, RunnerConfig,
};
use conveyor_core::domain::{AuditAction, PipelineKind, TaskStatus};
use conveyor_core::impls::{InMemoryTaskStore, RecordingAuditSink, SimulatedBackend};
use conveyor_core::pipelines::{HIERARCHY_EXTRACTED, PublicationRequest, ReductionRequest};
use conveyor_core::ports::TaskStore;
use conveyor_core::typed::sha256_hex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{temp_dir, wait_for};

struct Setup {
    engine: Arc<Engine>,
    store: Arc<InMemoryTaskStore>,
    audit: Arc<RecordingAuditSink>,
    dir: PathBuf,
}

fn fast_monitor() -> MonitorConfig {
    MonitorConfig {
        poll_interval_ms: 10,
        launch_stagger_ms: 0,
        stop_wait_base_secs: 1,
        ..MonitorConfig::default()
    }
}

fn setup(test_name: &str) -> Setup {
    let dir = temp_dir(test_name);
    let config = EngineConfig {
        publication: fast_monitor(),
        reduction: MonitorConfig {
            instance_index: 1,
            ..fast_monitor()
        },
        runner: RunnerConfig {
            backend_poll_interval_ms: 5,
            ..RunnerConfig::default()
        },
        workspace_root: dir.join("work"),
        publish_root: dir.join("published"),
        ..EngineConfig::default()
    };
    let store = Arc::new(InMemoryTaskStore::new());
    let audit = Arc::new(RecordingAuditSink::new());
    let engine = EngineBuilder::new(config)
        .store(store.clone())
        .backend(Arc::new(SimulatedBackend::new()))
        .audit(audit.clone())
        .recovery_lock(Arc::new(tokio::sync::Mutex::new(())))
        .with_document_pipelines()
        .expect("register pipelines")
        .build()
        .expect("build engine");
    Setup {
        engine: Arc::new(engine),
        store,
        audit,
        dir,
    }
}

fn write_source(dir: &Path, document: &serde_json::Value) -> (PathBuf, String) {
    let bytes = serde_json::to_vec(document).unwrap();
    let path = dir.join("source.json");
    std::fs::write(&path, &bytes).unwrap();
    (path, sha256_hex(&bytes))
}

fn document() -> serde_json::Value {
    json!({
        "header": { "title": "Q3", "author": "kim" },
        "body": { "intro": "hello", "sections": ["a", "b"] }
    })
}

fn start(engine: &Arc<Engine>, shutdown: &CancellationToken) -> tokio::task::JoinHandle<Result<(), MonitorError>> {
    let engine = Arc::clone(engine);
    let shutdown = shutdown.clone();
    tokio::spawn(async move { engine.run(shutdown).await })
}

#[tokio::test]
async fn publication_then_reductions_in_creation_order() {
    let s = setup("flow_ordered");
    let (source_path, checksum) = write_source(&s.dir, &document());

    let publication = s
        .engine
        .submit(
            &PublicationRequest {
                content_id: "report-9".to_string(),
                source_path: source_path.clone(),
                checksum: checksum.clone(),
                reducing: true,
            },
            None,
        )
        .await
        .unwrap();
    let reduction = |selections: &[&str]| ReductionRequest {
        content_id: "report-9".to_string(),
        source_path: source_path.clone(),
        checksum: checksum.clone(),
        selections: selections.iter().map(|s| s.to_string()).collect(),
    };
    let first = s
        .engine
        .submit(&reduction(&["header/title", "body/sections/1"]), Some(publication.id))
        .await
        .unwrap();
    let second = s
        .engine
        .submit(&reduction(&["body/intro"]), Some(publication.id))
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let run = start(&s.engine, &shutdown);
    wait_for(s.store.as_ref(), |c| c.success == 3).await;

    let parent = s.store.get(publication.id).await.unwrap().unwrap();
    assert!(parent.has_checkpoint(HIERARCHY_EXTRACTED));
    let published = s.dir.join("published/report-9").join(publication.id.to_string());
    assert!(published.join("published.json").exists());
    assert!(published.join("hierarchy.json").exists());

    // each reduction keeps its own artifact, matching what its task recorded
    let expected = [
        (first.id, json!({ "header": { "title": "Q3" }, "body": { "sections": ["b"] } })),
        (second.id, json!({ "body": { "intro": "hello" } })),
    ];
    let mut paths = Vec::new();
    for (id, document) in expected {
        let record = s.store.get(id).await.unwrap().unwrap();
        let result = record.outcome.expect("outcome recorded").result;
        let path = PathBuf::from(result["reduced_path"].as_str().unwrap());
        assert!(path.starts_with(s.dir.join("published/report-9").join(id.to_string())));
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(result["sha256"], json!(sha256_hex(&bytes)));
        let reduced: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reduced, document);
        paths.push(path);
    }
    assert_ne!(paths[0], paths[1]);

    let reduced_order: Vec<_> = s
        .audit
        .events()
        .into_iter()
        .filter(|e| e.action == AuditAction::Reduced)
        .map(|e| e.task_id)
        .collect();
    assert_eq!(reduced_order, vec![first.id, second.id]);

    let first_done = s.store.get(first.id).await.unwrap().unwrap();
    assert_eq!(first_done.parent_id, Some(publication.id));

    shutdown.cancel();
    assert_eq!(run.await.unwrap(), Err(MonitorError::Canceled));
    let status = s.engine.status().await.unwrap();
    assert!(status.is_stopped());
    assert_eq!(status.queue.success, 3);
}

#[tokio::test]
async fn reduction_waits_for_hierarchy_checkpoint() {
    let s = setup("flow_gated");
    let (source_path, checksum) = write_source(&s.dir, &document());

    // not reducing: the parent never records the checkpoint
    let publication = s
        .engine
        .submit(
            &PublicationRequest {
                content_id: "memo-1".to_string(),
                source_path: source_path.clone(),
                checksum: checksum.clone(),
                reducing: false,
            },
            None,
        )
        .await
        .unwrap();
    let reduction = s
        .engine
        .submit(
            &ReductionRequest {
                content_id: "memo-1".to_string(),
                source_path,
                checksum,
                selections: vec!["header/title".to_string()],
            },
            Some(publication.id),
        )
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let run = start(&s.engine, &shutdown);
    wait_for(s.store.as_ref(), |c| c.success == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let waiting = s.store.get(reduction.id).await.unwrap().unwrap();
    assert_eq!(waiting.status, TaskStatus::Queued);

    shutdown.cancel();
    run.await.unwrap().unwrap_err();
}

#[tokio::test]
async fn canceling_a_publication_cancels_its_reductions() {
    let s = setup("flow_cancel");
    let (source_path, checksum) = write_source(&s.dir, &document());
    let publication = s
        .engine
        .submit(
            &PublicationRequest {
                content_id: "brief-2".to_string(),
                source_path: source_path.clone(),
                checksum: checksum.clone(),
                reducing: true,
            },
            None,
        )
        .await
        .unwrap();
    let reduction = s
        .engine
        .submit(
            &ReductionRequest {
                content_id: "brief-2".to_string(),
                source_path,
                checksum,
                selections: vec!["body/intro".to_string()],
            },
            Some(publication.id),
        )
        .await
        .unwrap();

    let canceled = s
        .engine
        .store()
        .cancel(publication.id, "withdrawn by editor")
        .await
        .unwrap();
    assert_eq!(canceled.len(), 2);
    assert!(canceled.contains(&reduction.id));

    let shutdown = CancellationToken::new();
    let run = start(&s.engine, &shutdown);
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    run.await.unwrap().unwrap_err();

    let counts = s.store.counts().await.unwrap();
    assert_eq!(counts.canceled, 2);
    assert_eq!(counts.success, 0);
    assert!(s.engine.monitor(PipelineKind::Reduction).is_some());
}
