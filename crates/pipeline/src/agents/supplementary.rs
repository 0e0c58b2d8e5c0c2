//! Supplementary generation: optional b-roll stills, one per segment.
//! Units are independent, with no continuity chain and no ordering requirement,
//! but they still run sequentially to keep error handling and cost
//! predictable.

use async_trait::async_trait;
use db::models::{
    asset::{Asset, AssetKind},
    pipeline_job::PipelineStep,
    scene::Scene,
};
use providers::ImageOptions;
use uuid::Uuid;

use crate::continuity::BatchReport;

use super::{
    AgentContext, StageAgent, StageError, load_current_scenes, load_project,
    record_unit_failure, submit_poll_persist,
};

const STAGE: &str = "supplementary";

pub struct SupplementaryAgent {
    ctx: AgentContext,
}

impl SupplementaryAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    async fn broll_unit(&self, project_id: Uuid, scene: &Scene) -> Result<String, StageError> {
        let prompt = format!(
            "Cinematic b-roll still, no people in frame: {}",
            scene.visual_description
        );
        let opts = ImageOptions {
            aspect_ratio: Some("9:16".to_string()),
            negative_prompt: Some("text, watermark, faces".to_string()),
        };
        let poll = self.ctx.poll_options(self.ctx.config.image_poll);

        submit_poll_persist(
            &self.ctx,
            project_id,
            Some(scene.id),
            AssetKind::SupplementaryImage,
            || self.ctx.provider.generate_image(&prompt, &opts),
            &poll,
            self.ctx.config.cost.image_task,
            STAGE,
        )
        .await
    }
}

#[async_trait]
impl StageAgent for SupplementaryAgent {
    fn step(&self) -> PipelineStep {
        PipelineStep::Supplementary
    }

    async fn run(&self, project_id: Uuid) -> Result<BatchReport, StageError> {
        load_project(&self.ctx, project_id).await?;
        let (_script, scenes) = load_current_scenes(&self.ctx, project_id).await?;

        Asset::delete_by_kinds(
            &self.ctx.pool,
            project_id,
            &[AssetKind::SupplementaryImage],
        )
        .await?;

        let mut report = BatchReport::default();
        for scene in &scenes {
            match self.broll_unit(project_id, scene).await {
                Ok(_) => report.record_success(),
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
