//! Casting stage: one character reference portrait per segment, conditioned
//! on the influencer chosen at the selection gate. Portraits are chained so
//! the character reads as the same person across segments.

use async_trait::async_trait;
use db::models::{
    asset::{Asset, AssetKind},
    pipeline_job::PipelineStep,
    scene::Scene,
};
use providers::ImageOptions;
use uuid::Uuid;

use crate::continuity::{BatchReport, ContinuityChain};

use super::{
    AgentContext, StageAgent, StageError, load_current_scenes, load_project,
    record_unit_failure, submit_poll_persist,
};

const STAGE: &str = "casting";

pub struct CastingAgent {
    ctx: AgentContext,
}

impl CastingAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    async fn portrait_unit(
        &self,
        project_id: Uuid,
        scene: &Scene,
        influencer_url: &str,
        chain: &ContinuityChain,
    ) -> Result<String, StageError> {
        let refs = chain.reference_urls(&[influencer_url]);
        let prompt = format!(
            "Portrait reference of the same character for this scene: {}. \
             Keep face, hair and wardrobe identical to the reference images.",
            scene.visual_description
        );
        let opts = ImageOptions {
            aspect_ratio: Some("9:16".to_string()),
            negative_prompt: None,
        };
        let poll = self.ctx.poll_options(self.ctx.config.image_poll);

        submit_poll_persist(
            &self.ctx,
            project_id,
            Some(scene.id),
            AssetKind::Portrait,
            || self.ctx.provider.edit_image(&refs, &prompt, &opts),
            &poll,
            self.ctx.config.cost.image_task,
            STAGE,
        )
        .await
    }
}

#[async_trait]
impl StageAgent for CastingAgent {
    fn step(&self) -> PipelineStep {
        PipelineStep::Casting
    }

    async fn run(&self, project_id: Uuid) -> Result<BatchReport, StageError> {
        let project = load_project(&self.ctx, project_id).await?;
        let influencer_url = project.influencer_image_url.clone().ok_or_else(|| {
            StageError::Validation(format!("Project {project_id} has no influencer selected"))
        })?;
        let (_script, scenes) = load_current_scenes(&self.ctx, project_id).await?;

        // Portraits are re-creatable: drop any prior batch so a re-run
        // cannot accumulate duplicates.
        Asset::delete_by_kinds(&self.ctx.pool, project_id, &[AssetKind::Portrait]).await?;

        let mut report = BatchReport::default();
        let mut chain = ContinuityChain::new(None);

        for scene in &scenes {
            match self
                .portrait_unit(project_id, scene, &influencer_url, &chain)
                .await
            {
                Ok(url) => {
                    chain.advance(url);
                    report.record_success();
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        "[{STAGE}] segment {} failed for {project_id}: {e}",
                        scene.segment_index
                    );
                    record_unit_failure(&self.ctx, project_id, STAGE, scene.segment_index, &e)
                        .await;
                    report.record_failure();
                }
            }
        }

        report.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubProvider, seed_project, seed_script, test_ctx, test_pool};
    use db::models::{
        asset::AssetStatus,
        audit_event::AuditEvent,
        project::{Project, ProjectStatus},
    };

    const INFLUENCER: &str = "https://cdn.test/influencer.png";

    async fn seeded(stub: &std::sync::Arc<StubProvider>) -> (AgentContext, Uuid) {
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        seed_script(&pool, project.id).await;
        Project::set_influencer(&pool, project.id, INFLUENCER, "voice-1")
            .await
            .unwrap();
        (test_ctx(pool, stub.clone()), project.id)
    }

    #[tokio::test]
    async fn test_partial_batch_failure_tolerated() {
        // Scenario: units 2 and 4 of 4 throw during submission.
        let stub = StubProvider::new();
        stub.fail_submissions(&[1, 3]);
        let (ctx, project_id) = seeded(&stub).await;

        let report = CastingAgent::new(ctx.clone())
            .run(project_id)
            .await
            .expect("two successes keep the stage alive");
        assert_eq!((report.succeeded, report.failed), (2, 2));

        let portraits = Asset::find_by_kind(&ctx.pool, project_id, AssetKind::Portrait)
            .await
            .unwrap();
        assert_eq!(portraits.len(), 4);
        assert_eq!(
            portraits
                .iter()
                .filter(|a| a.status == AssetStatus::Completed)
                .count(),
            2
        );
        assert_eq!(
            portraits
                .iter()
                .filter(|a| a.status == AssetStatus::Failed)
                .count(),
            2
        );

        let errors = AuditEvent::list_by_type(&ctx.pool, project_id, "segment_error")
            .await
            .unwrap();
        assert_eq!(errors.len(), 2);

        let project = Project::find_by_id(&ctx.pool, project_id)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(project.status, ProjectStatus::Failed);
    }

    #[tokio::test]
    async fn test_all_units_failing_fails_stage() {
        let stub = StubProvider::new();
        stub.fail_submissions(&[0, 1, 2, 3]);
        let (ctx, project_id) = seeded(&stub).await;

        let result = CastingAgent::new(ctx).run(project_id).await;
        assert!(matches!(result, Err(StageError::BatchFailed { total: 4 })));
    }

    #[tokio::test]
    async fn test_chain_keeps_last_success_across_failure() {
        let stub = StubProvider::new();
        stub.fail_submissions(&[1]);
        let (ctx, project_id) = seeded(&stub).await;

        CastingAgent::new(ctx).run(project_id).await.unwrap();

        let refs = stub.edit_image_refs.lock().unwrap();
        assert_eq!(refs.len(), 4);
        assert_eq!(refs[0], vec![INFLUENCER.to_string()]);
        // unit 1 failed, so units 1 and 2 both chain from unit 0's output
        assert_eq!(refs[1][1], "https://cdn.test/task-0.png");
        assert_eq!(refs[2][1], "https://cdn.test/task-0.png");
        // unit 3 chains from unit 2
        assert_eq!(refs[3][1], "https://cdn.test/task-2.png");
    }

    #[tokio::test]
    async fn test_missing_influencer_is_validation_without_calls() {
        let stub = StubProvider::new();
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        seed_script(&pool, project.id).await;
        let ctx = test_ctx(pool, stub.clone());

        let result = CastingAgent::new(ctx).run(project.id).await;
        assert!(matches!(result, Err(StageError::Validation(_))));
        assert_eq!(stub.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rerun_does_not_accumulate_portraits() {
        let stub = StubProvider::new();
        let (ctx, project_id) = seeded(&stub).await;
        let agent = CastingAgent::new(ctx.clone());

        agent.run(project_id).await.unwrap();
        agent.run(project_id).await.unwrap();

        let portraits = Asset::find_by_kind(&ctx.pool, project_id, AssetKind::Portrait)
            .await
            .unwrap();
        assert_eq!(portraits.len(), 4);
    }

    #[tokio::test]
    async fn test_cancellation_is_not_a_failure() {
        let stub = StubProvider::new();
        let (ctx, project_id) = seeded(&stub).await;
        ctx.cancel.cancel();

        let result = CastingAgent::new(ctx).run(project_id).await;
        assert!(matches!(result, Err(StageError::Cancelled)));
    }
}
