use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Portrait,
    KeyframeStart,
    KeyframeEnd,
    Video,
    Audio,
    SupplementaryImage,
    FinalOutput,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Portrait => "portrait",
            AssetKind::KeyframeStart => "keyframe_start",
            AssetKind::KeyframeEnd => "keyframe_end",
            AssetKind::Video => "video",
            AssetKind::Audio => "audio",
            AssetKind::SupplementaryImage => "supplementary_image",
            AssetKind::FinalOutput => "final_output",
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Generating,
    Completed,
    Failed,
}

impl std::fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetStatus::Generating => write!(f, "generating"),
            AssetStatus::Completed => write!(f, "completed"),
            AssetStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One generated artifact. Created when a provider task is submitted
/// (status=generating) and resolved to completed or failed when the task
/// reaches a terminal state.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    pub project_id: Uuid,
    pub scene_id: Option<Uuid>,
    pub kind: AssetKind,
    pub status: AssetStatus,
    pub provider: Option<String>,
    pub provider_task_id: Option<String>,
    pub url: Option<String>,
    pub cost_usd: f64,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAsset {
    pub project_id: Uuid,
    pub scene_id: Option<Uuid>,
    pub kind: AssetKind,
    pub provider: Option<String>,
    pub provider_task_id: Option<String>,
    pub metadata: Option<String>,
}

impl Asset {
    pub async fn create(
        pool: &SqlitePool,
        asset_id: Uuid,
        data: &CreateAsset,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Asset>(
            r#"
            INSERT INTO assets (
                id, project_id, scene_id, kind, provider, provider_task_id, metadata
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            RETURNING *
            "#,
        )
        .bind(asset_id)
        .bind(data.project_id)
        .bind(data.scene_id)
        .bind(data.kind)
        .bind(&data.provider)
        .bind(&data.provider_task_id)
        .bind(&data.metadata)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Asset>(r#"SELECT * FROM assets WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn mark_completed(
        pool: &SqlitePool,
        id: Uuid,
        url: &str,
        cost_usd: f64,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Asset>(
            r#"
            UPDATE assets
            SET status = 'completed',
                url = ?1,
                cost_usd = ?2,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?3
            RETURNING *
            "#,
        )
        .bind(url)
        .bind(cost_usd)
        .bind(id)
        .fetch_one(pool)
        .await
    }

    /// Resolve a generating asset as failed; the error goes into metadata.
    pub async fn mark_failed(
        pool: &SqlitePool,
        id: Uuid,
        metadata: &str,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Asset>(
            r#"
            UPDATE assets
            SET status = 'failed',
                metadata = ?1,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?2
            RETURNING *
            "#,
        )
        .bind(metadata)
        .bind(id)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_project(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Asset>(
            r#"
            SELECT * FROM assets
            WHERE project_id = ?1
            ORDER BY created_at ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(pool)
        .await
    }

    pub async fn find_by_kind(
        pool: &SqlitePool,
        project_id: Uuid,
        kind: AssetKind,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Asset>(
            r#"
            SELECT * FROM assets
            WHERE project_id = ?1 AND kind = ?2
            ORDER BY created_at ASC
            "#,
        )
        .bind(project_id)
        .bind(kind)
        .fetch_all(pool)
        .await
    }

    /// Latest completed asset of a kind for one scene. Editing uses this to
    /// collect the video and audio tracks in segment order.
    pub async fn find_completed_for_scene(
        pool: &SqlitePool,
        scene_id: Uuid,
        kind: AssetKind,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Asset>(
            r#"
            SELECT * FROM assets
            WHERE scene_id = ?1 AND kind = ?2 AND status = 'completed'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(scene_id)
        .bind(kind)
        .fetch_optional(pool)
        .await
    }

    /// Pre-stage cleanup: drop all rows of the given re-creatable kinds so
    /// a re-run (or a redelivered job) cannot accumulate duplicates.
    pub async fn delete_by_kinds(
        pool: &SqlitePool,
        project_id: Uuid,
        kinds: &[AssetKind],
    ) -> Result<u64, sqlx::Error> {
        let mut deleted = 0;
        for kind in kinds {
            let result = sqlx::query("DELETE FROM assets WHERE project_id = ?1 AND kind = ?2")
                .bind(project_id)
                .bind(kind)
                .execute(pool)
                .await?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    /// `(kind, status, count)` rollup backing the progress read model.
    pub async fn status_counts(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<(AssetKind, AssetStatus, i64)>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT kind, status, COUNT(*)
            FROM assets
            WHERE project_id = ?1
            GROUP BY kind, status
            "#,
        )
        .bind(project_id)
        .fetch_all(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_utils::{setup_test_pool, test_project};

    async fn insert_asset(pool: &SqlitePool, project_id: Uuid, kind: AssetKind) -> Asset {
        Asset::create(
            pool,
            Uuid::new_v4(),
            &CreateAsset {
                project_id,
                scene_id: None,
                kind,
                provider: Some("stub".into()),
                provider_task_id: Some("task-1".into()),
                metadata: None,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_asset_lifecycle() {
        let pool = setup_test_pool().await;
        let project = test_project(&pool).await;

        let asset = insert_asset(&pool, project.id, AssetKind::Video).await;
        assert_eq!(asset.status, AssetStatus::Generating);
        assert!(asset.url.is_none());

        let done = Asset::mark_completed(&pool, asset.id, "https://cdn/video.mp4", 0.25)
            .await
            .unwrap();
        assert_eq!(done.status, AssetStatus::Completed);
        assert_eq!(done.url.as_deref(), Some("https://cdn/video.mp4"));
        assert!((done.cost_usd - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_delete_by_kinds_scopes_to_kind_and_project() {
        let pool = setup_test_pool().await;
        let project = test_project(&pool).await;
        let other = test_project(&pool).await;

        insert_asset(&pool, project.id, AssetKind::Portrait).await;
        insert_asset(&pool, project.id, AssetKind::Portrait).await;
        insert_asset(&pool, project.id, AssetKind::Video).await;
        insert_asset(&pool, other.id, AssetKind::Portrait).await;

        let deleted = Asset::delete_by_kinds(&pool, project.id, &[AssetKind::Portrait])
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        assert_eq!(
            Asset::find_by_kind(&pool, project.id, AssetKind::Video)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            Asset::find_by_kind(&pool, other.id, AssetKind::Portrait)
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
