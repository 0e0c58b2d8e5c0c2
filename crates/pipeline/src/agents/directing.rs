//! Directing stage: per segment, a start keyframe, an end keyframe and a
//! video clip between them. Segments run strictly in index order because
//! each start keyframe is conditioned on the previous segment's end
//! keyframe for visual continuity.

use async_trait::async_trait;
use db::models::{
    asset::{Asset, AssetKind},
    pipeline_job::PipelineStep,
    project::Project,
    scene::Scene,
};
use providers::{ImageOptions, VideoRequest};
use uuid::Uuid;

use crate::continuity::{BatchReport, ContinuityChain};

use super::{
    AgentContext, StageAgent, StageError, load_current_scenes, load_project,
    record_unit_failure, submit_poll_persist,
};

const STAGE: &str = "directing";

pub struct DirectingAgent {
    ctx: AgentContext,
}

impl DirectingAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    /// One segment: keyframe_start -> keyframe_end -> video. Returns the
    /// end keyframe URL, which is this unit's terminal output for the
    /// continuity chain.
    async fn segment_unit(
        &self,
        project: &Project,
        scene: &Scene,
        chain: &ContinuityChain,
    ) -> Result<String, StageError> {
        let identity_url = match Asset::find_completed_for_scene(
            &self.ctx.pool,
            scene.id,
            AssetKind::Portrait,
        )
        .await?
        {
            Some(portrait) => portrait.url,
            None => None,
        }
        .or_else(|| project.influencer_image_url.clone())
        .ok_or_else(|| {
            StageError::Validation(format!(
                "Segment {} has no portrait and no influencer reference",
                scene.segment_index
            ))
        })?;

        let image_opts = ImageOptions {
            aspect_ratio: Some("9:16".to_string()),
            negative_prompt: None,
        };
        let image_poll = self.ctx.poll_options(self.ctx.config.image_poll);

        let start_refs = chain.reference_urls(&[&identity_url]);
        let start_prompt = format!(
            "Opening frame of the shot: {}. Match the character and lighting of the references.",
            scene.visual_description
        );
        let start_url = submit_poll_persist(
            &self.ctx,
            project.id,
            Some(scene.id),
            AssetKind::KeyframeStart,
            || self.ctx.provider.edit_image(&start_refs, &start_prompt, &image_opts),
            &image_poll,
            self.ctx.config.cost.image_task,
            STAGE,
        )
        .await?;

        let end_refs = vec![start_url.clone()];
        let end_prompt = format!(
            "Final frame of the same shot: {}. Same character, same setting, the action resolved.",
            scene.visual_description
        );
        let end_url = submit_poll_persist(
            &self.ctx,
            project.id,
            Some(scene.id),
            AssetKind::KeyframeEnd,
            || self.ctx.provider.edit_image(&end_refs, &end_prompt, &image_opts),
            &image_poll,
            self.ctx.config.cost.image_task,
            STAGE,
        )
        .await?;

        let video_request = VideoRequest {
            prompt: scene.visual_description.clone(),
            first_frame_url: Some(start_url),
            last_frame_url: Some(end_url.clone()),
            duration_seconds: project.segment_duration_seconds as u32,
        };
        let video_poll = self.ctx.poll_options(self.ctx.config.video_poll);
        submit_poll_persist(
            &self.ctx,
            project.id,
            Some(scene.id),
            AssetKind::Video,
            || self.ctx.provider.generate_video(&video_request),
            &video_poll,
            self.ctx.config.cost.video_task,
            STAGE,
        )
        .await?;

        Ok(end_url)
    }
}

#[async_trait]
impl StageAgent for DirectingAgent {
    fn step(&self) -> PipelineStep {
        PipelineStep::Directing
    }

    async fn run(&self, project_id: Uuid) -> Result<BatchReport, StageError> {
        let project = load_project(&self.ctx, project_id).await?;
        if project.influencer_image_url.is_none() {
            return Err(StageError::Validation(format!(
                "Project {project_id} has no influencer selected"
            )));
        }
        let (_script, scenes) = load_current_scenes(&self.ctx, project_id).await?;

        // Keyframes and clips are regenerated wholesale on a re-run.
        Asset::delete_by_kinds(
            &self.ctx.pool,
            project_id,
            &[
                AssetKind::KeyframeStart,
                AssetKind::KeyframeEnd,
                AssetKind::Video,
            ],
        )
        .await?;

        let mut report = BatchReport::default();
        let mut chain = ContinuityChain::new(None);

        for scene in &scenes {
            match self.segment_unit(&project, scene, &chain).await {
                Ok(end_keyframe_url) => {
                    chain.advance(end_keyframe_url);
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
    use db::models::{asset::AssetStatus, project::Project as DbProject};

    #[tokio::test]
    async fn test_missing_script_fails_before_any_call() {
        let stub = StubProvider::new();
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        DbProject::set_influencer(&pool, project.id, "https://cdn.test/ref.png", "voice-1")
            .await
            .unwrap();
        let ctx = test_ctx(pool, stub.clone());

        let result = DirectingAgent::new(ctx).run(project.id).await;
        assert!(matches!(result, Err(StageError::Validation(_))));
        assert_eq!(stub.call_count(), 0);
    }

    #[tokio::test]
    async fn test_happy_path_produces_keyframes_and_clips() {
        let stub = StubProvider::new();
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        seed_script(&pool, project.id).await;
        DbProject::set_influencer(&pool, project.id, "https://cdn.test/ref.png", "voice-1")
            .await
            .unwrap();
        let ctx = test_ctx(pool, stub.clone());

        let report = DirectingAgent::new(ctx.clone())
            .run(project.id)
            .await
            .unwrap();
        assert_eq!((report.succeeded, report.failed), (4, 0));

        for kind in [AssetKind::KeyframeStart, AssetKind::KeyframeEnd, AssetKind::Video] {
            let assets = Asset::find_by_kind(&ctx.pool, project.id, kind).await.unwrap();
            assert_eq!(assets.len(), 4, "expected 4 {kind} assets");
            assert!(assets.iter().all(|a| a.status == AssetStatus::Completed));
        }

        // cost: 8 image tasks + 4 video tasks
        let reloaded = DbProject::find_by_id(&ctx.pool, project.id)
            .await
            .unwrap()
            .unwrap();
        let expected =
            8.0 * ctx.config.cost.image_task + 4.0 * ctx.config.cost.video_task;
        assert!((reloaded.cost_usd - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failed_segment_does_not_break_chain() {
        let stub = StubProvider::new();
        // Segment 1's start keyframe submission is call index 3
        // (segment 0 made calls 0..=2).
        stub.fail_submissions(&[3]);
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        seed_script(&pool, project.id).await;
        DbProject::set_influencer(&pool, project.id, "https://cdn.test/ref.png", "voice-1")
            .await
            .unwrap();
        let ctx = test_ctx(pool, stub.clone());

        let report = DirectingAgent::new(ctx).run(project.id).await.unwrap();
        assert_eq!((report.succeeded, report.failed), (3, 1));

        // Both segment 1 and segment 2 chain their start keyframe from
        // segment 0's end keyframe (task-1): the failed segment 1 did not
        // reset the reference.
        let refs = stub.edit_image_refs.lock().unwrap();
        let chained_from_segment0 = refs
            .iter()
            .filter(|r| r.contains(&"https://cdn.test/task-1.png".to_string()))
            .count();
        assert_eq!(chained_from_segment0, 2);
    }
}
