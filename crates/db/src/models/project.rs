use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Project not found")]
    NotFound,
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: ProjectStatus,
        to: ProjectStatus,
    },
}

/// Single source of truth for where a project sits in the pipeline.
///
/// Review gates are sinks for automatic progression: only the recovery
/// surface (approve / select / rollback) moves a project out of one.
/// Active stages are exited by the stage handler on success or failure.
#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Created,
    Analyzing,
    AnalysisReview,
    Scripting,
    ScriptReview,
    InfluencerSelection,
    Casting,
    CastingReview,
    Directing,
    AssetReview,
    VoiceSynthesis,
    SupplementaryGeneration,
    SupplementaryReview,
    Editing,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub const ALL: [ProjectStatus; 16] = [
        ProjectStatus::Created,
        ProjectStatus::Analyzing,
        ProjectStatus::AnalysisReview,
        ProjectStatus::Scripting,
        ProjectStatus::ScriptReview,
        ProjectStatus::InfluencerSelection,
        ProjectStatus::Casting,
        ProjectStatus::CastingReview,
        ProjectStatus::Directing,
        ProjectStatus::AssetReview,
        ProjectStatus::VoiceSynthesis,
        ProjectStatus::SupplementaryGeneration,
        ProjectStatus::SupplementaryReview,
        ProjectStatus::Editing,
        ProjectStatus::Completed,
        ProjectStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Created => "created",
            ProjectStatus::Analyzing => "analyzing",
            ProjectStatus::AnalysisReview => "analysis_review",
            ProjectStatus::Scripting => "scripting",
            ProjectStatus::ScriptReview => "script_review",
            ProjectStatus::InfluencerSelection => "influencer_selection",
            ProjectStatus::Casting => "casting",
            ProjectStatus::CastingReview => "casting_review",
            ProjectStatus::Directing => "directing",
            ProjectStatus::AssetReview => "asset_review",
            ProjectStatus::VoiceSynthesis => "voice_synthesis",
            ProjectStatus::SupplementaryGeneration => "supplementary_generation",
            ProjectStatus::SupplementaryReview => "supplementary_review",
            ProjectStatus::Editing => "editing",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
        }
    }

    pub fn is_review_gate(&self) -> bool {
        matches!(
            self,
            ProjectStatus::AnalysisReview
                | ProjectStatus::ScriptReview
                | ProjectStatus::InfluencerSelection
                | ProjectStatus::CastingReview
                | ProjectStatus::AssetReview
                | ProjectStatus::SupplementaryReview
        )
    }

    pub fn is_active_stage(&self) -> bool {
        matches!(
            self,
            ProjectStatus::Analyzing
                | ProjectStatus::Scripting
                | ProjectStatus::Casting
                | ProjectStatus::Directing
                | ProjectStatus::VoiceSynthesis
                | ProjectStatus::SupplementaryGeneration
                | ProjectStatus::Editing
        )
    }

    /// Legal outgoing edges. `Completed` is terminal; `Failed` can re-enter
    /// any retryable active stage (retry-in-place) or any review gate
    /// (rollback-to-prior-gate).
    pub fn allowed_transitions(&self) -> &'static [ProjectStatus] {
        match self {
            ProjectStatus::Created => &[ProjectStatus::Analyzing],
            ProjectStatus::Analyzing => &[ProjectStatus::AnalysisReview, ProjectStatus::Failed],
            ProjectStatus::AnalysisReview => &[ProjectStatus::Scripting],
            ProjectStatus::Scripting => &[ProjectStatus::ScriptReview, ProjectStatus::Failed],
            ProjectStatus::ScriptReview => &[
                ProjectStatus::InfluencerSelection,
                ProjectStatus::AnalysisReview,
            ],
            ProjectStatus::InfluencerSelection => {
                &[ProjectStatus::Casting, ProjectStatus::ScriptReview]
            }
            ProjectStatus::Casting => &[ProjectStatus::CastingReview, ProjectStatus::Failed],
            ProjectStatus::CastingReview => &[
                ProjectStatus::Directing,
                ProjectStatus::InfluencerSelection,
            ],
            ProjectStatus::Directing => &[ProjectStatus::AssetReview, ProjectStatus::Failed],
            ProjectStatus::AssetReview => &[
                ProjectStatus::VoiceSynthesis,
                ProjectStatus::CastingReview,
            ],
            ProjectStatus::VoiceSynthesis => &[
                ProjectStatus::SupplementaryGeneration,
                ProjectStatus::Editing,
                ProjectStatus::Failed,
            ],
            ProjectStatus::SupplementaryGeneration => {
                &[ProjectStatus::SupplementaryReview, ProjectStatus::Failed]
            }
            ProjectStatus::SupplementaryReview => {
                &[ProjectStatus::Editing, ProjectStatus::AssetReview]
            }
            ProjectStatus::Editing => &[ProjectStatus::Completed, ProjectStatus::Failed],
            ProjectStatus::Completed => &[],
            ProjectStatus::Failed => &[
                ProjectStatus::Analyzing,
                ProjectStatus::Scripting,
                ProjectStatus::Casting,
                ProjectStatus::Directing,
                ProjectStatus::VoiceSynthesis,
                ProjectStatus::SupplementaryGeneration,
                ProjectStatus::Editing,
                ProjectStatus::AnalysisReview,
                ProjectStatus::ScriptReview,
                ProjectStatus::InfluencerSelection,
                ProjectStatus::CastingReview,
                ProjectStatus::AssetReview,
                ProjectStatus::SupplementaryReview,
            ],
        }
    }

    pub fn can_transition_to(&self, to: ProjectStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// The review gate immediately before this status in the fixed stage
    /// order, used by rollback. The first gate has no prior.
    pub fn prior_review_gate(&self) -> Option<ProjectStatus> {
        match self {
            ProjectStatus::Scripting | ProjectStatus::ScriptReview => {
                Some(ProjectStatus::AnalysisReview)
            }
            ProjectStatus::InfluencerSelection => Some(ProjectStatus::ScriptReview),
            ProjectStatus::Casting | ProjectStatus::CastingReview => {
                Some(ProjectStatus::InfluencerSelection)
            }
            ProjectStatus::Directing | ProjectStatus::AssetReview => {
                Some(ProjectStatus::CastingReview)
            }
            ProjectStatus::VoiceSynthesis
            | ProjectStatus::SupplementaryGeneration
            | ProjectStatus::SupplementaryReview => Some(ProjectStatus::AssetReview),
            ProjectStatus::Editing => Some(ProjectStatus::SupplementaryReview),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub title: String,
    pub status: ProjectStatus,
    pub error_message: Option<String>,
    pub failed_at_status: Option<ProjectStatus>,
    pub cost_usd: f64,
    pub segment_count: i64,
    pub segment_duration_seconds: i64,
    pub segment_arcs: String, // JSON array of per-segment arc labels
    pub analysis: Option<String>,
    pub influencer_image_url: Option<String>,
    pub voice_id: Option<String>,
    pub supplementary_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProject {
    pub title: String,
    pub segment_count: i64,
    pub segment_duration_seconds: i64,
    pub segment_arcs: Vec<String>,
    pub supplementary_enabled: bool,
}

impl Project {
    pub async fn create(
        pool: &SqlitePool,
        project_id: Uuid,
        data: &CreateProject,
    ) -> Result<Self, ProjectError> {
        let arcs = serde_json::to_string(&data.segment_arcs).unwrap_or_else(|_| "[]".to_string());
        let project = sqlx::query_as::<_, Project>(
            r#"
            INSERT INTO projects (
                id, title, segment_count, segment_duration_seconds,
                segment_arcs, supplementary_enabled
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING *
            "#,
        )
        .bind(project_id)
        .bind(&data.title)
        .bind(data.segment_count)
        .bind(data.segment_duration_seconds)
        .bind(arcs)
        .bind(data.supplementary_enabled)
        .fetch_one(pool)
        .await?;

        Ok(project)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, ProjectError> {
        let project = sqlx::query_as::<_, Project>(r#"SELECT * FROM projects WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(project)
    }

    /// Move a project along one edge of the status graph.
    ///
    /// Rejects any `(from, to)` pair outside `allowed_transitions` without
    /// touching the row. The UPDATE is guarded on the observed status, so a
    /// concurrent transition makes this call fail rather than clobber.
    /// Leaving `failed` clears `error_message` and `failed_at_status`.
    pub async fn transition(
        pool: &SqlitePool,
        id: Uuid,
        to: ProjectStatus,
    ) -> Result<Self, ProjectError> {
        let current = Self::find_by_id(pool, id)
            .await?
            .ok_or(ProjectError::NotFound)?;

        if !current.status.can_transition_to(to) {
            return Err(ProjectError::InvalidTransition {
                from: current.status,
                to,
            });
        }

        let clear_failure = current.status == ProjectStatus::Failed;
        let updated = sqlx::query_as::<_, Project>(
            r#"
            UPDATE projects
            SET status = ?1,
                error_message = CASE WHEN ?2 THEN NULL ELSE error_message END,
                failed_at_status = CASE WHEN ?2 THEN NULL ELSE failed_at_status END,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?3 AND status = ?4
            RETURNING *
            "#,
        )
        .bind(to)
        .bind(clear_failure)
        .bind(id)
        .bind(current.status)
        .fetch_optional(pool)
        .await?;

        updated.ok_or(ProjectError::InvalidTransition {
            from: current.status,
            to,
        })
    }

    /// Record a stage failure: `status=failed`, plus where and why.
    pub async fn mark_failed(
        pool: &SqlitePool,
        id: Uuid,
        failed_at: ProjectStatus,
        message: &str,
    ) -> Result<Self, ProjectError> {
        let current = Self::find_by_id(pool, id)
            .await?
            .ok_or(ProjectError::NotFound)?;

        if !current.status.can_transition_to(ProjectStatus::Failed) {
            return Err(ProjectError::InvalidTransition {
                from: current.status,
                to: ProjectStatus::Failed,
            });
        }

        let updated = sqlx::query_as::<_, Project>(
            r#"
            UPDATE projects
            SET status = 'failed',
                error_message = ?1,
                failed_at_status = ?2,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?3
            RETURNING *
            "#,
        )
        .bind(message)
        .bind(failed_at)
        .bind(id)
        .fetch_one(pool)
        .await?;

        Ok(updated)
    }

    /// Atomic cost-ledger increment: a single SQL update, safe under
    /// concurrent stage runs. This is the default path.
    pub async fn increment_cost(
        pool: &SqlitePool,
        id: Uuid,
        amount_usd: f64,
    ) -> Result<f64, ProjectError> {
        let (cost,): (f64,) = sqlx::query_as(
            r#"
            UPDATE projects
            SET cost_usd = cost_usd + ?1,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?2
            RETURNING cost_usd
            "#,
        )
        .bind(amount_usd)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(ProjectError::NotFound)?;

        Ok(cost)
    }

    /// Read-then-write fallback for storage layers without an atomic
    /// increment. Racy under contention: two overlapping calls can lose an
    /// update. Kept as a degraded path only; callers should prefer
    /// [`Project::increment_cost`].
    pub async fn increment_cost_non_atomic(
        pool: &SqlitePool,
        id: Uuid,
        amount_usd: f64,
    ) -> Result<f64, ProjectError> {
        let current = Self::find_by_id(pool, id)
            .await?
            .ok_or(ProjectError::NotFound)?;
        let next = current.cost_usd + amount_usd;

        sqlx::query(
            r#"
            UPDATE projects
            SET cost_usd = ?1, updated_at = datetime('now', 'subsec')
            WHERE id = ?2
            "#,
        )
        .bind(next)
        .bind(id)
        .execute(pool)
        .await?;

        Ok(next)
    }

    pub async fn set_analysis(
        pool: &SqlitePool,
        id: Uuid,
        analysis: &str,
    ) -> Result<Self, ProjectError> {
        let updated = sqlx::query_as::<_, Project>(
            r#"
            UPDATE projects
            SET analysis = ?1, updated_at = datetime('now', 'subsec')
            WHERE id = ?2
            RETURNING *
            "#,
        )
        .bind(analysis)
        .bind(id)
        .fetch_optional(pool)
        .await?;

        updated.ok_or(ProjectError::NotFound)
    }

    /// Record the influencer reference image and voice chosen at the
    /// influencer-selection gate.
    pub async fn set_influencer(
        pool: &SqlitePool,
        id: Uuid,
        influencer_image_url: &str,
        voice_id: &str,
    ) -> Result<Self, ProjectError> {
        let updated = sqlx::query_as::<_, Project>(
            r#"
            UPDATE projects
            SET influencer_image_url = ?1,
                voice_id = ?2,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?3
            RETURNING *
            "#,
        )
        .bind(influencer_image_url)
        .bind(voice_id)
        .bind(id)
        .fetch_optional(pool)
        .await?;

        updated.ok_or(ProjectError::NotFound)
    }

    /// Per-segment arc labels, parsed from the stored JSON array.
    pub fn segment_arc_list(&self) -> Vec<String> {
        serde_json::from_str(&self.segment_arcs).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_utils::setup_test_pool;

    async fn make_project(pool: &SqlitePool) -> Project {
        Project::create(
            pool,
            Uuid::new_v4(),
            &CreateProject {
                title: "Desert trek".to_string(),
                segment_count: 4,
                segment_duration_seconds: 8,
                segment_arcs: vec!["setup".into(), "rise".into(), "peak".into(), "outro".into()],
                supplementary_enabled: true,
            },
        )
        .await
        .expect("create project")
    }

    async fn force_status(pool: &SqlitePool, id: Uuid, status: ProjectStatus) {
        sqlx::query("UPDATE projects SET status = ?1 WHERE id = ?2")
            .bind(status)
            .bind(id)
            .execute(pool)
            .await
            .expect("force status");
    }

    #[tokio::test]
    async fn test_create_defaults() {
        let pool = setup_test_pool().await;
        let project = make_project(&pool).await;
        assert_eq!(project.status, ProjectStatus::Created);
        assert_eq!(project.cost_usd, 0.0);
        assert!(project.error_message.is_none());
        assert_eq!(project.segment_arc_list().len(), 4);
    }

    #[tokio::test]
    async fn test_transition_matrix_exhaustive() {
        let pool = setup_test_pool().await;
        let project = make_project(&pool).await;

        for from in ProjectStatus::ALL {
            for to in ProjectStatus::ALL {
                force_status(&pool, project.id, from).await;
                let result = Project::transition(&pool, project.id, to).await;
                let reloaded = Project::find_by_id(&pool, project.id)
                    .await
                    .unwrap()
                    .unwrap();
                if from.can_transition_to(to) {
                    assert!(result.is_ok(), "expected {from} -> {to} to be legal");
                    assert_eq!(reloaded.status, to);
                } else {
                    assert!(
                        matches!(result, Err(ProjectError::InvalidTransition { .. })),
                        "expected {from} -> {to} to be rejected"
                    );
                    assert_eq!(reloaded.status, from, "rejected {from} -> {to} mutated status");
                }
            }
        }
    }

    #[tokio::test]
    async fn test_completed_is_terminal() {
        assert!(ProjectStatus::Completed.allowed_transitions().is_empty());
    }

    #[tokio::test]
    async fn test_leaving_failed_clears_error_fields() {
        let pool = setup_test_pool().await;
        let project = make_project(&pool).await;
        force_status(&pool, project.id, ProjectStatus::Directing).await;

        let failed =
            Project::mark_failed(&pool, project.id, ProjectStatus::Directing, "provider 502")
                .await
                .unwrap();
        assert_eq!(failed.status, ProjectStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("provider 502"));
        assert_eq!(failed.failed_at_status, Some(ProjectStatus::Directing));

        let retried = Project::transition(&pool, project.id, ProjectStatus::Directing)
            .await
            .unwrap();
        assert_eq!(retried.status, ProjectStatus::Directing);
        assert!(retried.error_message.is_none());
        assert!(retried.failed_at_status.is_none());
    }

    #[tokio::test]
    async fn test_mark_failed_rejected_from_gate() {
        let pool = setup_test_pool().await;
        let project = make_project(&pool).await;
        force_status(&pool, project.id, ProjectStatus::ScriptReview).await;

        let result =
            Project::mark_failed(&pool, project.id, ProjectStatus::ScriptReview, "boom").await;
        assert!(matches!(
            result,
            Err(ProjectError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_increment_cost_concurrent_atomic() {
        let pool = setup_test_pool().await;
        let project = make_project(&pool).await;

        let (a, b) = tokio::join!(
            Project::increment_cost(&pool, project.id, 0.25),
            Project::increment_cost(&pool, project.id, 0.75),
        );
        a.unwrap();
        b.unwrap();

        let reloaded = Project::find_by_id(&pool, project.id)
            .await
            .unwrap()
            .unwrap();
        assert!((reloaded.cost_usd - 1.0).abs() < f64::EPSILON);
    }
}
