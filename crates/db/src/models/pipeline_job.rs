use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use uuid::Uuid;

use super::project::ProjectStatus;

/// The fixed pipeline stage identifiers a durable job can name.
#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Analysis,
    Scripting,
    Casting,
    Directing,
    VoiceSynthesis,
    Supplementary,
    Editing,
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::Analysis => "analysis",
            PipelineStep::Scripting => "scripting",
            PipelineStep::Casting => "casting",
            PipelineStep::Directing => "directing",
            PipelineStep::VoiceSynthesis => "voice_synthesis",
            PipelineStep::Supplementary => "supplementary",
            PipelineStep::Editing => "editing",
        }
    }

    /// The status a stage handler sets while this step runs.
    pub fn in_progress_status(&self) -> ProjectStatus {
        match self {
            PipelineStep::Analysis => ProjectStatus::Analyzing,
            PipelineStep::Scripting => ProjectStatus::Scripting,
            PipelineStep::Casting => ProjectStatus::Casting,
            PipelineStep::Directing => ProjectStatus::Directing,
            PipelineStep::VoiceSynthesis => ProjectStatus::VoiceSynthesis,
            PipelineStep::Supplementary => ProjectStatus::SupplementaryGeneration,
            PipelineStep::Editing => ProjectStatus::Editing,
        }
    }

    /// The review gate a successful run parks the project at. Voice
    /// synthesis has no human checkpoint (it auto-chains) and editing
    /// completes the project, so both return None.
    pub fn review_gate(&self) -> Option<ProjectStatus> {
        match self {
            PipelineStep::Analysis => Some(ProjectStatus::AnalysisReview),
            PipelineStep::Scripting => Some(ProjectStatus::ScriptReview),
            PipelineStep::Casting => Some(ProjectStatus::CastingReview),
            PipelineStep::Directing => Some(ProjectStatus::AssetReview),
            PipelineStep::Supplementary => Some(ProjectStatus::SupplementaryReview),
            PipelineStep::VoiceSynthesis | PipelineStep::Editing => None,
        }
    }

    /// Which step re-runs a stage that failed at the given status.
    pub fn for_status(status: ProjectStatus) -> Option<PipelineStep> {
        match status {
            ProjectStatus::Analyzing => Some(PipelineStep::Analysis),
            ProjectStatus::Scripting => Some(PipelineStep::Scripting),
            ProjectStatus::Casting => Some(PipelineStep::Casting),
            ProjectStatus::Directing => Some(PipelineStep::Directing),
            ProjectStatus::VoiceSynthesis => Some(PipelineStep::VoiceSynthesis),
            ProjectStatus::SupplementaryGeneration => Some(PipelineStep::Supplementary),
            ProjectStatus::Editing => Some(PipelineStep::Editing),
            _ => None,
        }
    }
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// A durable stage job. Delivery is at-least-once: a claimed job that
/// errors is re-queued with a delay until its attempts are spent, so every
/// stage agent must tolerate re-runs.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PipelineJob {
    pub id: Uuid,
    pub project_id: Uuid,
    pub step: PipelineStep,
    pub payload: String,
    pub status: JobStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineJob {
    pub async fn enqueue(
        pool: &SqlitePool,
        project_id: Uuid,
        step: PipelineStep,
        payload: serde_json::Value,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, PipelineJob>(
            r#"
            INSERT INTO pipeline_jobs (id, project_id, step, payload)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(step)
        .bind(payload.to_string())
        .fetch_one(pool)
        .await
    }

    /// Claim the oldest due job in one guarded UPDATE so two workers can
    /// never run the same delivery.
    pub async fn claim_next(pool: &SqlitePool) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, PipelineJob>(
            r#"
            UPDATE pipeline_jobs
            SET status = 'running',
                attempts = attempts + 1,
                updated_at = datetime('now', 'subsec')
            WHERE id = (
                SELECT id FROM pipeline_jobs
                WHERE status = 'queued' AND available_at <= datetime('now', 'subsec')
                ORDER BY created_at ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .fetch_optional(pool)
        .await
    }

    pub async fn mark_completed(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET status = 'completed', updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Put a delivery back on the queue after a handler error.
    pub async fn requeue(
        pool: &SqlitePool,
        id: Uuid,
        delay_seconds: i64,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET status = 'queued',
                last_error = ?1,
                available_at = datetime('now', 'subsec', '+' || ?2 || ' seconds'),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?3
            "#,
        )
        .bind(error)
        .bind(delay_seconds)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(pool: &SqlitePool, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET status = 'failed',
                last_error = ?1,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?2
            "#,
        )
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_project(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, PipelineJob>(
            r#"
            SELECT * FROM pipeline_jobs
            WHERE project_id = ?1
            ORDER BY created_at ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(pool)
        .await
    }
}
