//! SimulatedBackend - in-process stand-in for the document backend.
//!
//! Jobs do the real JSON work (hierarchy extraction, reduction, publish
//! rendering) at submit time, then report their status through a scripted
//! sequence of polls so tests can exercise both timeout windows.
//!
//! # Scripting
//! - `not_started_polls`: polls answered with `NotStarted`
//! - `running_polls`: polls answered with `Running` after that
//! - `outcome`: what the poll after that reports (`Hang` keeps `Running`)

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{FieldNode, reduce_document};
use crate::ports::{
    BackendArtifact, BackendError, BackendHandle, BackendJob, BackendOperation, BackendStatus,
    ExecutionBackend,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOutcome {
    Complete,
    Fail(String),
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimScript {
    pub not_started_polls: u32,
    pub running_polls: u32,
    pub outcome: SimOutcome,
}

impl SimScript {
    /// Completes on the first poll.
    pub fn immediate() -> Self {
        Self {
            not_started_polls: 0,
            running_polls: 0,
            outcome: SimOutcome::Complete,
        }
    }

    pub fn completes_after(not_started_polls: u32, running_polls: u32) -> Self {
        Self {
            not_started_polls,
            running_polls,
            outcome: SimOutcome::Complete,
        }
    }

    pub fn fails(message: impl Into<String>) -> Self {
        Self {
            outcome: SimOutcome::Fail(message.into()),
            ..Self::immediate()
        }
    }

    /// Never leaves `NotStarted`.
    pub fn never_starts() -> Self {
        Self {
            not_started_polls: u32::MAX,
            running_polls: 0,
            outcome: SimOutcome::Hang,
        }
    }

    /// Starts, then stays `Running`.
    pub fn never_finishes() -> Self {
        Self {
            outcome: SimOutcome::Hang,
            ..Self::immediate()
        }
    }
}

impl Default for SimScript {
    fn default() -> Self {
        Self::immediate()
    }
}

struct SimJob {
    job: BackendJob,
    script: SimScript,
    polls: u32,
    canceled: bool,
    /// Result of running the operation; `Err` surfaces as `Failed`.
    artifacts: Result<Vec<BackendArtifact>, String>,
}

impl SimJob {
    fn status(&self) -> BackendStatus {
        if self.canceled {
            return BackendStatus::Failed("canceled".to_string());
        }
        let script = &self.script;
        if self.polls <= script.not_started_polls {
            return BackendStatus::NotStarted;
        }
        let started = self.polls - script.not_started_polls;
        if started <= script.running_polls {
            return BackendStatus::Running;
        }
        match (&script.outcome, &self.artifacts) {
            (SimOutcome::Hang, _) => BackendStatus::Running,
            (SimOutcome::Fail(message), _) => BackendStatus::Failed(message.clone()),
            (SimOutcome::Complete, Err(message)) => BackendStatus::Failed(message.clone()),
            (SimOutcome::Complete, Ok(_)) => BackendStatus::Succeeded,
        }
    }
}

#[derive(Default)]
struct SimState {
    default_script: SimScript,
    stage_scripts: HashMap<&'static str, SimScript>,
    unavailable: bool,
    jobs: HashMap<BackendHandle, SimJob>,
    submitted: Vec<BackendJob>,
    canceled: Vec<BackendHandle>,
}

#[derive(Default)]
pub struct SimulatedBackend {
    state: Mutex<SimState>,
    next_handle: AtomicU64,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: SimScript) -> Self {
        let backend = Self::new();
        backend.lock().default_script = script;
        backend
    }

    /// Override the script for one operation (`"extract_hierarchy"`,
    /// `"reduce"`, `"publish"`).
    pub fn script_stage(&self, stage: &'static str, script: SimScript) {
        self.lock().stage_scripts.insert(stage, script);
    }

    /// Make `submit` fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Every job ever submitted, in order.
    pub fn submitted(&self) -> Vec<BackendJob> {
        self.lock().submitted.clone()
    }

    /// Handles that received `cancel`.
    pub fn canceled(&self) -> Vec<BackendHandle> {
        self.lock().canceled.clone()
    }

    /// Jobs submitted but not yet deleted.
    pub fn live_jobs(&self) -> usize {
        self.lock().jobs.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn run_operation(job: &BackendJob) -> Result<Vec<BackendArtifact>, String> {
    let bytes = tokio::fs::read(&job.input)
        .await
        .map_err(|e| format!("cannot read {}: {e}", job.input.display()))?;
    let document: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|e| format!("input is not JSON: {e}"))?;

    let (name, value) = match &job.operation {
        BackendOperation::ExtractHierarchy => {
            let tree = FieldNode::from_json("document", &document);
            let value = serde_json::to_value(tree).map_err(|e| e.to_string())?;
            ("hierarchy.json", value)
        }
        BackendOperation::Reduce { selections } => {
            ("reduced.json", reduce_document(&document, selections.as_slice()))
        }
        BackendOperation::Publish => (
            "published.json",
            serde_json::json!({ "label": job.label, "document": document }),
        ),
    };
    let bytes = serde_json::to_vec_pretty(&value).map_err(|e| e.to_string())?;
    Ok(vec![BackendArtifact {
        name: name.to_string(),
        bytes,
    }])
}

#[async_trait]
impl ExecutionBackend for SimulatedBackend {
    async fn submit(&self, job: BackendJob) -> Result<BackendHandle, BackendError> {
        let (unavailable, script) = {
            let state = self.lock();
            let script = state
                .stage_scripts
                .get(job.operation.stage())
                .unwrap_or(&state.default_script)
                .clone();
            (state.unavailable, script)
        };
        if unavailable {
            return Err(BackendError::Unavailable("simulated outage".to_string()));
        }

        let artifacts = run_operation(&job).await;
        let handle = BackendHandle::new(format!(
            "sim-{}",
            self.next_handle.fetch_add(1, Ordering::Relaxed)
        ));
        debug!(%handle, label = %job.label, stage = job.operation.stage(), "simulated job submitted");

        let mut state = self.lock();
        state.submitted.push(job.clone());
        state.jobs.insert(
            handle.clone(),
            SimJob {
                job,
                script,
                polls: 0,
                canceled: false,
                artifacts,
            },
        );
        Ok(handle)
    }

    async fn poll_status(&self, handle: &BackendHandle) -> Result<BackendStatus, BackendError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(handle)
            .ok_or_else(|| BackendError::UnknownJob(handle.clone()))?;
        job.polls = job.polls.saturating_add(1);
        Ok(job.status())
    }

    async fn fetch_artifacts(
        &self,
        handle: &BackendHandle,
    ) -> Result<Vec<BackendArtifact>, BackendError> {
        let state = self.lock();
        let job = state
            .jobs
            .get(handle)
            .ok_or_else(|| BackendError::UnknownJob(handle.clone()))?;
        match (job.status(), &job.artifacts) {
            (BackendStatus::Succeeded, Ok(artifacts)) => Ok(artifacts.clone()),
            _ => Err(BackendError::NotReady(handle.clone())),
        }
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<(), BackendError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(job) = state.jobs.get_mut(handle) {
            job.canceled = true;
            debug!(%handle, label = %job.job.label, "simulated job canceled");
            state.canceled.push(handle.clone());
        }
        Ok(())
    }

    async fn delete(&self, handle: &BackendHandle) -> Result<(), BackendError> {
        self.lock().jobs.remove(handle);
        Ok(())
    }
}
