//! conveyor - runs the publication and reduction monitors.
//!
//! Environment:
//! - `CONVEYOR_CONFIG`: path to a JSON `EngineConfig` (defaults otherwise)
//! - `DATABASE_URL`: use Postgres; without it an in-memory store is used
//!   and a demo document is queued
//! - `CONVEYOR_LOG_JSON=1`: JSON log lines; `RUST_LOG` filters

use std::sync::Arc;

use anyhow::Context;
use conveyor_core::app::{Engine, EngineBuilder, EngineConfig};
use conveyor_core::impls::{InMemoryTaskStore, SimulatedBackend};
use conveyor_core::pipelines::{PublicationRequest, ReductionRequest};
use conveyor_core::ports::TaskStore;
use conveyor_core::typed::sha256_hex;
use conveyor_pg::PgTaskStore;
use serde_json::json;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("CONVEYOR_LOG_JSON").is_ok_and(|v| v == "1");
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if json {
        builder.json().with_target(true).try_init()
    } else {
        builder.try_init()
    };
}

async fn load_config() -> anyhow::Result<EngineConfig> {
    match std::env::var("CONVEYOR_CONFIG") {
        Ok(path) => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading config {path}"))?;
            EngineConfig::from_json_str(&raw).with_context(|| format!("parsing config {path}"))
        }
        Err(_) => Ok(EngineConfig::default()),
    }
}

async fn open_store() -> anyhow::Result<(Arc<dyn TaskStore>, bool)> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let store = PgTaskStore::connect(&url, 8)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("migrating schema")?;
            info!("using postgres task store");
            Ok((Arc::new(store), false))
        }
        Err(_) => {
            info!("DATABASE_URL not set; using in-memory store with demo tasks");
            Ok((Arc::new(InMemoryTaskStore::new()), true))
        }
    }
}

/// Queue one reducing publication and a reduction of it.
async fn submit_demo(engine: &Engine, config: &EngineConfig) -> anyhow::Result<()> {
    let document = json!({
        "header": { "title": "Quarterly report", "author": "finance" },
        "body": { "intro": "Revenue grew.", "sections": ["sales", "costs", "outlook"] }
    });
    let bytes = serde_json::to_vec_pretty(&document)?;
    let source_dir = config.workspace_root.join("demo-sources");
    tokio::fs::create_dir_all(&source_dir).await?;
    let source_path = source_dir.join("report.json");
    tokio::fs::write(&source_path, &bytes).await?;
    let checksum = sha256_hex(&bytes);

    let publication = engine
        .submit(
            &PublicationRequest {
                content_id: "report-demo".to_string(),
                source_path: source_path.clone(),
                checksum: checksum.clone(),
                reducing: true,
            },
            None,
        )
        .await?;
    engine
        .submit(
            &ReductionRequest {
                content_id: "report-demo".to_string(),
                source_path,
                checksum,
                selections: vec!["header/title".to_string(), "body/sections/2".to_string()],
            },
            Some(publication.id),
        )
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = load_config().await?;
    let (store, demo) = open_store().await?;
    let engine = Arc::new(
        EngineBuilder::new(config.clone())
            .store(store)
            .backend(Arc::new(SimulatedBackend::new()))
            .with_document_pipelines()?
            .build()?,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for ctrl-c");
                return;
            }
            info!("ctrl-c received; draining");
            shutdown.cancel();
        }
    });

    if demo {
        submit_demo(&engine, &config).await?;
        // demo: stop once nothing is left to do
        tokio::spawn({
            let engine = Arc::clone(&engine);
            let shutdown = shutdown.clone();
            async move {
                loop {
                    sleep(Duration::from_millis(200)).await;
                    match engine.status().await {
                        Ok(status) if status.queue.queued + status.queue.processing == 0 => {
                            shutdown.cancel();
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "status query failed"),
                    }
                }
            }
        });
    }

    // always Err(Canceled) after a clean drain
    if let Err(e) = engine.run(shutdown).await {
        info!(reason = %e, "engine stopped");
    }
    let status = engine.status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
