//! Voice synthesis stage: one TTS call per segment with dialogue. The
//! synthesized track is written under the asset directory; object storage
//! proper is outside the pipeline.

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use db::models::{
    asset::{Asset, AssetKind, CreateAsset},
    pipeline_job::PipelineStep,
    scene::Scene,
};
use providers::ProviderError;
use serde_json::json;
use uuid::Uuid;

use crate::continuity::BatchReport;

use super::{
    AgentContext, StageAgent, StageError, load_current_scenes, load_project,
    record_unit_failure, track_cost,
};

const STAGE: &str = "voice_synthesis";

pub struct VoiceAgent {
    ctx: AgentContext,
}

impl VoiceAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    async fn synthesize_unit(
        &self,
        project_id: Uuid,
        voice_id: &str,
        scene: &Scene,
    ) -> Result<String, StageError> {
        let synth = || async {
            self.ctx
                .provider
                .text_to_speech(voice_id, &scene.dialogue)
                .await
        };
        let result = synth
            .retry(
                &ConstantBuilder::default()
                    .with_delay(self.ctx.config.unit_retry_delay())
                    .with_max_times(self.ctx.config.unit_retry_attempts),
            )
            .notify(|err: &ProviderError, dur| {
                tracing::warn!("[{STAGE}] tts failed, retrying after {dur:?}: {err}");
            })
            .await;

        let asset = Asset::create(
            &self.ctx.pool,
            Uuid::new_v4(),
            &CreateAsset {
                project_id,
                scene_id: Some(scene.id),
                kind: AssetKind::Audio,
                provider: Some("http".to_string()),
                provider_task_id: None,
                metadata: Some(json!({ "voice_id": voice_id }).to_string()),
            },
        )
        .await?;

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                Asset::mark_failed(
                    &self.ctx.pool,
                    asset.id,
                    &json!({ "error": e.to_string(), "voice_id": voice_id }).to_string(),
                )
                .await?;
                return Err(e.into());
            }
        };

        let path = utils::assets::project_audio_dir(&project_id.to_string()).join(format!(
            "segment_{:02}_v{}.mp3",
            scene.segment_index, scene.version
        ));
        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            Asset::mark_failed(
                &self.ctx.pool,
                asset.id,
                &json!({ "error": e.to_string(), "path": path.to_string_lossy() }).to_string(),
            )
            .await?;
            return Err(e.into());
        }

        let url = path.to_string_lossy().to_string();
        Asset::mark_completed(&self.ctx.pool, asset.id, &url, self.ctx.config.cost.tts_call)
            .await?;
        track_cost(&self.ctx, project_id, self.ctx.config.cost.tts_call, STAGE).await;
        Ok(url)
    }
}

#[async_trait]
impl StageAgent for VoiceAgent {
    fn step(&self) -> PipelineStep {
        PipelineStep::VoiceSynthesis
    }

    async fn run(&self, project_id: Uuid) -> Result<BatchReport, StageError> {
        let project = load_project(&self.ctx, project_id).await?;
        let voice_id = project.voice_id.clone().ok_or_else(|| {
            StageError::Validation(format!("Project {project_id} has no voice selected"))
        })?;
        let (_script, scenes) = load_current_scenes(&self.ctx, project_id).await?;

        let spoken: Vec<&Scene> = scenes
            .iter()
            .filter(|s| !s.dialogue.trim().is_empty())
            .collect();
        if spoken.is_empty() {
            return Err(StageError::Validation(format!(
                "Project {project_id} has no dialogue to synthesize"
            )));
        }

        Asset::delete_by_kinds(&self.ctx.pool, project_id, &[AssetKind::Audio]).await?;

        let mut report = BatchReport::default();
        for scene in spoken {
            if self.ctx.cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            match self.synthesize_unit(project_id, &voice_id, scene).await {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        StubProvider, ensure_asset_dir, seed_project, seed_script, test_ctx, test_pool,
    };
    use db::models::{asset::AssetStatus, project::Project};

    #[tokio::test]
    async fn test_missing_voice_is_validation_without_calls() {
        let stub = StubProvider::new();
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        seed_script(&pool, project.id).await;
        let ctx = test_ctx(pool, stub.clone());

        let result = VoiceAgent::new(ctx).run(project.id).await;
        assert!(matches!(result, Err(StageError::Validation(_))));
        assert_eq!(stub.call_count(), 0);
    }

    #[tokio::test]
    async fn test_synthesizes_one_track_per_spoken_segment() {
        ensure_asset_dir();
        let stub = StubProvider::new();
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        seed_script(&pool, project.id).await;
        Project::set_influencer(&pool, project.id, "https://cdn.test/ref.png", "voice-7")
            .await
            .unwrap();
        let ctx = test_ctx(pool, stub.clone());

        let report = VoiceAgent::new(ctx.clone()).run(project.id).await.unwrap();
        assert_eq!((report.succeeded, report.failed), (4, 0));

        let tracks = Asset::find_by_kind(&ctx.pool, project.id, AssetKind::Audio)
            .await
            .unwrap();
        assert_eq!(tracks.len(), 4);
        for track in &tracks {
            assert_eq!(track.status, AssetStatus::Completed);
            let path = std::path::Path::new(track.url.as_deref().unwrap());
            assert!(path.exists(), "missing audio file {}", path.display());
        }
    }
}
