//! Pipelines - the concrete content types and how their monitors select
//! work.
//!
//! A `PipelineProfile` is everything kind-specific a monitor needs: the
//! claim predicate, the orphan predicate, and how recovery treats the
//! orphan's sub-tasks and parent.

pub mod publication;
pub mod reduction;

use std::path::{Path, PathBuf};

use crate::app::config::MonitorConfig;
use crate::domain::{ContentType, FieldNode, PipelineKind, RunError};
use crate::ports::{BackendArtifact, BackendOperation, ClaimFilter, OrphanFilter};
use crate::typed::RunContext;

pub use self::publication::{PublicationRequest, PublicationRunner};
pub use self::reduction::{ReductionRequest, ReductionRunner};

/// Recorded by a publication once its hierarchy is extracted. Reduction
/// sub-tasks wait for it.
pub const HIERARCHY_EXTRACTED: &str = "hierarchy_extracted";

/// What recovery does with the sub-tasks of an orphan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubTaskPolicy {
    /// The pipeline has no sub-tasks.
    Ignore,
    /// Cancel sub-tasks that were in flight. When the orphan never reached
    /// `prerequisite`, cancel every open sub-task instead.
    CancelInFlight { prerequisite: &'static str },
}

/// What recovery does with an orphan that has a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentPolicy {
    /// The parent does not affect the decision.
    Independent,
    /// The orphan only retries under a parent that has settled. A parent
    /// that is missing, will re-run, or ended unsuccessfully cancels it.
    FollowParent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineProfile {
    pub kind: PipelineKind,
    pub claim: ClaimFilter,
    pub orphans: OrphanFilter,
    pub sub_tasks: SubTaskPolicy,
    pub parent: ParentPolicy,
}

impl PipelineProfile {
    pub fn for_kind(
        kind: PipelineKind,
        config: &MonitorConfig,
        content_types: Vec<ContentType>,
    ) -> Self {
        match kind {
            PipelineKind::Publication => publication::profile(config, content_types),
            PipelineKind::Reduction => reduction::profile(config, content_types),
        }
    }
}

async fn require_source(path: &Path) -> Result<(), RunError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(RunError::validation(format!(
            "source {} is not a file",
            path.display()
        ))),
        Err(_) => Err(RunError::validation(format!(
            "source {} does not exist",
            path.display()
        ))),
    }
}

fn artifact<'a>(
    artifacts: &'a [BackendArtifact],
    name: &str,
    stage: &str,
) -> Result<&'a [u8], RunError> {
    artifacts
        .iter()
        .find(|a| a.name == name)
        .map(|a| a.bytes.as_slice())
        .ok_or_else(|| RunError::backend(stage, format!("no {name} artifact")))
}

async fn extract_hierarchy(ctx: &RunContext, input: PathBuf) -> Result<FieldNode, RunError> {
    let operation = BackendOperation::ExtractHierarchy;
    let stage = operation.stage();
    let artifacts = ctx.run_backend(operation, input).await?;
    let bytes = artifact(&artifacts, "hierarchy.json", stage)?;
    serde_json::from_slice(bytes)
        .map_err(|e| RunError::backend(stage, format!("unreadable hierarchy: {e}")))
}
