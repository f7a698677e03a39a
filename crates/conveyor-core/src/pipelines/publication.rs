//! Publication pipeline (`publication.document.v1`).
//!
//! validate -> setup -> [extract hierarchy, checkpoint] -> publish ->
//! distribute. The hierarchy step only runs for content that will be
//! reduced; its checkpoint releases the reduction sub-tasks.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    HIERARCHY_EXTRACTED, ParentPolicy, PipelineProfile, SubTaskPolicy, artifact,
    extract_hierarchy, require_source,
};
use crate::app::config::MonitorConfig;
use crate::domain::{AuditAction, ContentType, PipelineKind, RunError};
use crate::ports::{BackendOperation, ClaimFilter, OrphanFilter};
use crate::typed::{JobRunner, PipelineRequest, RunContext, check_content_id};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationRequest {
    pub content_id: String,
    pub source_path: PathBuf,
    /// sha256 of the source, hex, optionally `sha256:`-prefixed.
    pub checksum: String,
    /// Reduction sub-tasks will follow; extract the hierarchy first.
    #[serde(default)]
    pub reducing: bool,
}

impl PipelineRequest for PublicationRequest {
    const CONTENT_TYPE: &'static str = "publication.document.v1";
    const KIND: PipelineKind = PipelineKind::Publication;

    fn content_id(&self) -> &str {
        &self.content_id
    }
}

impl PublicationRequest {
    fn validate(&self) -> Result<(), RunError> {
        check_content_id(&self.content_id)?;
        if self.checksum.trim().is_empty() {
            return Err(RunError::validation("checksum is empty"));
        }
        if self.source_path.as_os_str().is_empty() {
            return Err(RunError::validation("source_path is empty"));
        }
        Ok(())
    }
}

pub struct PublicationRunner;

#[async_trait]
impl JobRunner<PublicationRequest> for PublicationRunner {
    async fn execute(
        &self,
        request: PublicationRequest,
        ctx: &RunContext,
    ) -> Result<serde_json::Value, RunError> {
        request.validate()?;
        require_source(&request.source_path).await?;
        ctx.ensure_active()?;

        ctx.workspace().prepare().await?;
        let input = ctx
            .workspace()
            .stage_input(&request.source_path, &request.checksum)
            .await?;

        let mut hierarchy_fields = None;
        if request.reducing {
            let hierarchy = extract_hierarchy(ctx, input.clone()).await?;
            let bytes = serde_json::to_vec_pretty(&hierarchy)
                .map_err(|e| RunError::backend("extract_hierarchy", e))?;
            ctx.distribute("hierarchy.json", &bytes).await?;
            ctx.checkpoint(HIERARCHY_EXTRACTED).await?;
            ctx.audit(
                AuditAction::HierarchyExtracted,
                format!("{} fields", hierarchy.len()),
            )
            .await;
            hierarchy_fields = Some(hierarchy.len());
        }

        let operation = BackendOperation::Publish;
        let stage = operation.stage();
        let artifacts = ctx.run_backend(operation, input).await?;
        let published = ctx
            .distribute("published.json", artifact(&artifacts, "published.json", stage)?)
            .await?;
        ctx.audit(
            AuditAction::Published,
            published.path.display().to_string(),
        )
        .await;

        Ok(json!({
            "published_path": published.path,
            "sha256": published.sha256,
            "hierarchy_fields": hierarchy_fields,
        }))
    }
}

pub(super) fn profile(config: &MonitorConfig, content_types: Vec<ContentType>) -> PipelineProfile {
    let kind = PipelineKind::Publication;
    PipelineProfile {
        kind,
        claim: ClaimFilter::new(kind)
            .with_content_types(content_types.clone())
            .with_min_age(config.task_age()),
        orphans: OrphanFilter::new(kind).with_content_types(content_types),
        sub_tasks: SubTaskPolicy::CancelInFlight {
            prerequisite: HIERARCHY_EXTRACTED,
        },
        parent: ParentPolicy::Independent,
    }
}
