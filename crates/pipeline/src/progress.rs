//! Read model for recovery UIs: where the project is, where it stopped,
//! what each stage has produced so far.

use db::models::{
    asset::{Asset, AssetKind, AssetStatus},
    pipeline_job::PipelineStep,
    project::{Project, ProjectStatus},
    scene::Scene,
    script::Script,
};
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Project(#[from] db::models::project::ProjectError),
    #[error("Project not found")]
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageProgress {
    pub stage: PipelineStep,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectProgress {
    pub project_id: Uuid,
    pub status: ProjectStatus,
    pub failed_at_status: Option<ProjectStatus>,
    pub cost_usd: f64,
    pub stages: Vec<StageProgress>,
}

pub async fn project_progress(
    pool: &SqlitePool,
    project_id: Uuid,
) -> Result<ProjectProgress, ProgressError> {
    let project = Project::find_by_id(pool, project_id)
        .await?
        .ok_or(ProgressError::NotFound)?;

    let counts = Asset::status_counts(pool, project_id).await?;
    let count_of = |kind: AssetKind, status: AssetStatus| -> i64 {
        counts
            .iter()
            .find(|(k, s, _)| *k == kind && *s == status)
            .map(|(_, _, n)| *n)
            .unwrap_or(0)
    };
    let asset_progress = |stage: PipelineStep, kind: AssetKind, total: i64| StageProgress {
        stage,
        completed: count_of(kind, AssetStatus::Completed),
        failed: count_of(kind, AssetStatus::Failed),
        total,
    };

    let scenes = match Script::find_current(pool, project_id).await? {
        Some(script) => Scene::current_view(pool, script.id).await?,
        None => Vec::new(),
    };
    let spoken = scenes
        .iter()
        .filter(|s| !s.dialogue.trim().is_empty())
        .count() as i64;

    let segments = project.segment_count;
    let stages = vec![
        StageProgress {
            stage: PipelineStep::Analysis,
            completed: project.analysis.is_some() as i64,
            failed: 0,
            total: 1,
        },
        StageProgress {
            stage: PipelineStep::Scripting,
            completed: scenes.len() as i64,
            failed: 0,
            total: segments,
        },
        asset_progress(PipelineStep::Casting, AssetKind::Portrait, segments),
        asset_progress(PipelineStep::Directing, AssetKind::Video, segments),
        StageProgress {
            stage: PipelineStep::VoiceSynthesis,
            completed: count_of(AssetKind::Audio, AssetStatus::Completed),
            failed: count_of(AssetKind::Audio, AssetStatus::Failed),
            total: if scenes.is_empty() { segments } else { spoken },
        },
        asset_progress(
            PipelineStep::Supplementary,
            AssetKind::SupplementaryImage,
            if project.supplementary_enabled { segments } else { 0 },
        ),
        asset_progress(PipelineStep::Editing, AssetKind::FinalOutput, 1),
    ];

    Ok(ProjectProgress {
        project_id,
        status: project.status,
        failed_at_status: project.failed_at_status,
        cost_usd: project.cost_usd,
        stages,
    })
}
