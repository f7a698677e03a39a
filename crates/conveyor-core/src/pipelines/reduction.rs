//! Reduction pipeline (`reduction.document.v1`).
//!
//! validate -> setup -> extract hierarchy -> check selections -> reduce ->
//! distribute. Tasks of one content id run strictly one at a time, oldest
//! first, and only after the owning publication extracted its hierarchy.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use super::{
    HIERARCHY_EXTRACTED, ParentPolicy, PipelineProfile, SubTaskPolicy, artifact,
    extract_hierarchy, require_source,
};
use crate::app::config::MonitorConfig;
use crate::domain::{AuditAction, ContentType, PipelineKind, RunError};
use crate::ports::{BackendOperation, ClaimFilter, OrphanFilter};
use crate::typed::{JobRunner, PipelineRequest, RunContext, check_content_id};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionRequest {
    pub content_id: String,
    pub source_path: PathBuf,
    pub checksum: String,
    /// Field paths to keep (`header/title`).
    pub selections: Vec<String>,
}

impl PipelineRequest for ReductionRequest {
    const CONTENT_TYPE: &'static str = "reduction.document.v1";
    const KIND: PipelineKind = PipelineKind::Reduction;

    fn content_id(&self) -> &str {
        &self.content_id
    }
}

impl ReductionRequest {
    fn validate(&self) -> Result<(), RunError> {
        check_content_id(&self.content_id)?;
        if self.checksum.trim().is_empty() {
            return Err(RunError::validation("checksum is empty"));
        }
        if self.selections.is_empty() {
            return Err(RunError::validation("no selections requested"));
        }
        if self.selections.iter().any(|s| s.trim().is_empty()) {
            return Err(RunError::validation("blank selection path"));
        }
        Ok(())
    }
}

pub struct ReductionRunner;

#[async_trait]
impl JobRunner<ReductionRequest> for ReductionRunner {
    async fn execute(
        &self,
        request: ReductionRequest,
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

        let hierarchy = extract_hierarchy(ctx, input.clone()).await?;
        let (present, missing): (Vec<String>, Vec<String>) = request
            .selections
            .into_iter()
            .partition(|path| hierarchy.contains_path(path));
        if present.is_empty() {
            return Err(RunError::validation(format!(
                "none of the requested selections exist in the document: {}",
                missing.join(", ")
            )));
        }
        if !missing.is_empty() {
            warn!(task_id = %ctx.task_id(), ?missing, "skipping selections not in document");
        }
        ctx.audit(
            AuditAction::HierarchyExtracted,
            format!("{} fields, {} selected", hierarchy.len(), present.len()),
        )
        .await;

        let operation = BackendOperation::Reduce {
            selections: present.clone(),
        };
        let stage = operation.stage();
        let artifacts = ctx.run_backend(operation, input).await?;
        let reduced = ctx
            .distribute("reduced.json", artifact(&artifacts, "reduced.json", stage)?)
            .await?;
        ctx.audit(AuditAction::Reduced, reduced.path.display().to_string())
            .await;

        Ok(json!({
            "reduced_path": reduced.path,
            "sha256": reduced.sha256,
            "selections": present,
            "skipped": missing,
        }))
    }
}

pub(super) fn profile(config: &MonitorConfig, content_types: Vec<ContentType>) -> PipelineProfile {
    let kind = PipelineKind::Reduction;
    PipelineProfile {
        kind,
        claim: ClaimFilter::new(kind)
            .with_content_types(content_types.clone())
            .with_min_age(config.task_age())
            .serialize_per_content()
            .with_parent_checkpoint(HIERARCHY_EXTRACTED),
        orphans: OrphanFilter::new(kind).with_content_types(content_types),
        sub_tasks: SubTaskPolicy::Ignore,
        parent: ParentPolicy::FollowParent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, JobStatus};
    use crate::pipelines::fixtures::Fixture;
    use crate::typed::{DynRunner, TypedRunner, sha256_hex};

    fn request(fx: &Fixture, selections: &[&str]) -> ReductionRequest {
        let (source_path, checksum) = fx.source(
            "contract.json",
            &json!({
                "parties": { "buyer": "A", "seller": "B" },
                "price": 100,
                "annex": ["x", "y"]
            }),
        );
        ReductionRequest {
            content_id: "contract-1".to_string(),
            source_path,
            checksum,
            selections: selections.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn reduces_to_existing_selections() {
        let fx = Fixture::new();
        let req = request(&fx, &["parties/buyer", "annex/1", "missing/field"]);
        let (detail, ctx) = fx.claim(req.to_new_task().unwrap()).await;
        let id = detail.id;

        let out = TypedRunner::new(ReductionRunner).run(detail, ctx).await;
        assert_eq!(out.status, JobStatus::Succeeded, "{:?}", out.result.failure);
        assert_eq!(out.result.output["skipped"], json!(["missing/field"]));

        let path = fx
            .dir
            .join("published/contract-1")
            .join(id.to_string())
            .join("reduced.json");
        let reduced: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(reduced, json!({ "parties": { "buyer": "A" }, "annex": ["y"] }));

        let stages: Vec<_> = fx
            .backend
            .submitted()
            .into_iter()
            .map(|j| j.operation.stage())
            .collect();
        assert_eq!(stages, vec!["extract_hierarchy", "reduce"]);
        let actions: Vec<_> = fx.audit.events().into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::HierarchyExtracted, AuditAction::Reduced]);
    }

    #[tokio::test]
    async fn sibling_reductions_keep_separate_artifacts() {
        let fx = Fixture::new();
        let mut outputs = Vec::new();
        for selections in [&["parties/buyer"][..], &["price"][..]] {
            let (detail, ctx) = fx
                .claim(request(&fx, selections).to_new_task().unwrap())
                .await;
            let out = TypedRunner::new(ReductionRunner).run(detail, ctx).await;
            assert_eq!(out.status, JobStatus::Succeeded, "{:?}", out.result.failure);
            outputs.push(out.result.output);
        }

        let path = |output: &serde_json::Value| {
            PathBuf::from(output["reduced_path"].as_str().unwrap().to_string())
        };
        assert_ne!(path(&outputs[0]), path(&outputs[1]));
        for (output, expected) in outputs.iter().zip([
            json!({ "parties": { "buyer": "A" } }),
            json!({ "price": 100 }),
        ]) {
            let bytes = std::fs::read(path(output)).unwrap();
            assert_eq!(output["sha256"], json!(sha256_hex(&bytes)));
            let reduced: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(reduced, expected);
        }
    }

    #[tokio::test]
    async fn unsatisfiable_selection_is_a_validation_error() {
        let fx = Fixture::new();
        let (detail, ctx) = fx
            .claim(request(&fx, &["nothing/here"]).to_new_task().unwrap())
            .await;

        let out = TypedRunner::new(ReductionRunner).run(detail, ctx).await;
        let failure = out.result.failure.unwrap();
        assert_eq!(failure.kind, ErrorKind::Validation);
        assert!(failure.message.contains("nothing/here"));
        // only the hierarchy job ran, and it was cleaned up
        assert_eq!(fx.backend.submitted().len(), 1);
        assert_eq!(fx.backend.live_jobs(), 0);
        assert_eq!(
            fx.audit.events().last().map(|e| e.action),
            Some(AuditAction::ValidationFailed)
        );
    }

    #[tokio::test]
    async fn empty_selection_list_is_rejected_up_front() {
        let fx = Fixture::new();
        let (detail, ctx) = fx.claim(request(&fx, &[]).to_new_task().unwrap()).await;
        let out = TypedRunner::new(ReductionRunner).run(detail, ctx).await;
        assert_eq!(
            out.result.failure.unwrap().message,
            "validation failed: no selections requested"
        );
        assert!(fx.backend.submitted().is_empty());
    }

    #[test]
    fn profile_serializes_per_content_behind_parent_checkpoint() {
        let profile = profile(&MonitorConfig::default(), vec![ReductionRequest::content_type()]);
        assert!(profile.claim.serialize_per_content);
        assert_eq!(
            profile.claim.parent_checkpoint.as_deref(),
            Some(HIERARCHY_EXTRACTED)
        );
        assert_eq!(profile.sub_tasks, SubTaskPolicy::Ignore);
        assert_eq!(profile.parent, ParentPolicy::FollowParent);
    }
}
