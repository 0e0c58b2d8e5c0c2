//! Editing stage: hand the completed clips and voice tracks to the render
//! service as template modifications, poll the composite render, and
//! persist the final output.

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use db::models::{
    asset::{Asset, AssetKind, CreateAsset},
    pipeline_job::PipelineStep,
};
use providers::{Polled, ProviderError, RenderModification};
use serde_json::json;
use uuid::Uuid;

use crate::continuity::BatchReport;

use super::{AgentContext, StageAgent, StageError, load_current_scenes, load_project, track_cost};

const STAGE: &str = "editing";

pub struct EditingAgent {
    ctx: AgentContext,
}

impl EditingAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    /// Template modifications in segment order: the clip and, when present,
    /// the voice track for every segment that has a completed video.
    async fn collect_modifications(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<RenderModification>, StageError> {
        let (_script, scenes) = load_current_scenes(&self.ctx, project_id).await?;

        let mut modifications = Vec::new();
        for scene in &scenes {
            let video =
                Asset::find_completed_for_scene(&self.ctx.pool, scene.id, AssetKind::Video)
                    .await?;
            let Some(video_url) = video.and_then(|a| a.url) else {
                continue;
            };
            modifications.push(RenderModification {
                name: format!("video_{}", scene.segment_index),
                value: video_url,
            });

            let audio =
                Asset::find_completed_for_scene(&self.ctx.pool, scene.id, AssetKind::Audio)
                    .await?;
            if let Some(audio_url) = audio.and_then(|a| a.url) {
                modifications.push(RenderModification {
                    name: format!("audio_{}", scene.segment_index),
                    value: audio_url,
                });
            }
        }

        if modifications.is_empty() {
            return Err(StageError::Validation(format!(
                "Project {project_id} has no completed video to assemble"
            )));
        }
        Ok(modifications)
    }
}

#[async_trait]
impl StageAgent for EditingAgent {
    fn step(&self) -> PipelineStep {
        PipelineStep::Editing
    }

    async fn run(&self, project_id: Uuid) -> Result<BatchReport, StageError> {
        load_project(&self.ctx, project_id).await?;
        let modifications = self.collect_modifications(project_id).await?;
        let template_id = self.ctx.config.render_template_id.clone();

        Asset::delete_by_kinds(&self.ctx.pool, project_id, &[AssetKind::FinalOutput]).await?;

        let submit = || async {
            self.ctx
                .provider
                .render_composite(&template_id, &modifications)
                .await
        };
        let handle = submit
            .retry(
                &ConstantBuilder::default()
                    .with_delay(self.ctx.config.unit_retry_delay())
                    .with_max_times(self.ctx.config.unit_retry_attempts),
            )
            .notify(|err: &ProviderError, dur| {
                tracing::warn!("[{STAGE}] render submission failed, retrying after {dur:?}: {err}");
            })
            .await?;

        let asset = Asset::create(
            &self.ctx.pool,
            Uuid::new_v4(),
            &CreateAsset {
                project_id,
                scene_id: None,
                kind: AssetKind::FinalOutput,
                provider: Some("http".to_string()),
                provider_task_id: Some(handle.render_id.clone()),
                metadata: Some(json!({ "template_id": template_id }).to_string()),
            },
        )
        .await?;

        let poll = self.ctx.poll_options(self.ctx.config.render_poll);
        match self.ctx.provider.poll_render(&handle.render_id, &poll).await {
            Ok(Polled::Completed(output)) => {
                Asset::mark_completed(
                    &self.ctx.pool,
                    asset.id,
                    &output.url,
                    self.ctx.config.cost.render_task,
                )
                .await?;
                track_cost(&self.ctx, project_id, self.ctx.config.cost.render_task, STAGE)
                    .await;

                let mut report = BatchReport::default();
                report.record_success();
                Ok(report)
            }
            Ok(Polled::Cancelled) => Err(StageError::Cancelled),
            Err(e) => {
                Asset::mark_failed(
                    &self.ctx.pool,
                    asset.id,
                    &json!({ "error": e.to_string(), "render_id": handle.render_id }).to_string(),
                )
                .await?;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubProvider, seed_project, seed_script, test_ctx, test_pool};
    use db::models::asset::AssetStatus;
    use db::models::project::Project;

    #[tokio::test]
    async fn test_no_completed_video_is_validation() {
        let stub = StubProvider::new();
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        seed_script(&pool, project.id).await;
        let ctx = test_ctx(pool, stub.clone());

        let result = EditingAgent::new(ctx).run(project.id).await;
        assert!(matches!(result, Err(StageError::Validation(_))));
        assert_eq!(stub.call_count(), 0);
    }

    #[tokio::test]
    async fn test_render_assembles_completed_segments() {
        let stub = StubProvider::new();
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        let (_script, scenes) = seed_script(&pool, project.id).await;

        // two segments have clips and voice tracks, two have nothing
        for scene in scenes.iter().take(2) {
            for (kind, url) in [
                (AssetKind::Video, format!("https://cdn.test/clip_{}.mp4", scene.segment_index)),
                (AssetKind::Audio, format!("https://cdn.test/vo_{}.mp3", scene.segment_index)),
            ] {
                let asset = Asset::create(
                    &pool,
                    uuid::Uuid::new_v4(),
                    &CreateAsset {
                        project_id: project.id,
                        scene_id: Some(scene.id),
                        kind,
                        provider: Some("http".into()),
                        provider_task_id: None,
                        metadata: None,
                    },
                )
                .await
                .unwrap();
                Asset::mark_completed(&pool, asset.id, &url, 0.0).await.unwrap();
            }
        }

        let ctx = test_ctx(pool, stub.clone());
        let report = EditingAgent::new(ctx.clone()).run(project.id).await.unwrap();
        assert_eq!((report.succeeded, report.failed), (1, 0));

        let finals = Asset::find_by_kind(&ctx.pool, project.id, AssetKind::FinalOutput)
            .await
            .unwrap();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].status, AssetStatus::Completed);
        assert!(finals[0].url.as_deref().unwrap().ends_with(".mp4"));

        let reloaded = Project::find_by_id(&ctx.pool, project.id)
            .await
            .unwrap()
            .unwrap();
        assert!((reloaded.cost_usd - ctx.config.cost.render_task).abs() < 1e-9);
    }
}
