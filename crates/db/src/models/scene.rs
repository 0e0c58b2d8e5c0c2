use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// One version of one script segment. Rows are append-only: regenerating a
/// segment inserts `version = max_for_that_index + 1`, never an UPDATE.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Scene {
    pub id: Uuid,
    pub script_id: Uuid,
    pub segment_index: i64,
    pub version: i64,
    pub title: Option<String>,
    pub visual_description: String,
    pub dialogue: String,
    pub arc: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateScene {
    pub script_id: Uuid,
    pub segment_index: i64,
    pub version: i64,
    pub title: Option<String>,
    pub visual_description: String,
    pub dialogue: String,
    pub arc: Option<String>,
}

impl Scene {
    pub async fn create(
        pool: &SqlitePool,
        scene_id: Uuid,
        data: &CreateScene,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Scene>(
            r#"
            INSERT INTO scenes (
                id, script_id, segment_index, version, title,
                visual_description, dialogue, arc
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            RETURNING *
            "#,
        )
        .bind(scene_id)
        .bind(data.script_id)
        .bind(data.segment_index)
        .bind(data.version)
        .bind(&data.title)
        .bind(&data.visual_description)
        .bind(&data.dialogue)
        .bind(&data.arc)
        .fetch_one(pool)
        .await
    }

    /// The read projection of a script: exactly one row per segment index,
    /// the one with the highest version, ordered by segment index.
    pub async fn current_view(
        pool: &SqlitePool,
        script_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Scene>(
            r#"
            SELECT s.*
            FROM scenes s
            JOIN (
                SELECT segment_index, MAX(version) AS max_version
                FROM scenes
                WHERE script_id = ?1
                GROUP BY segment_index
            ) latest
              ON s.segment_index = latest.segment_index
             AND s.version = latest.max_version
            WHERE s.script_id = ?1
            ORDER BY s.segment_index ASC
            "#,
        )
        .bind(script_id)
        .fetch_all(pool)
        .await
    }

    /// Next version for one segment: `max + 1`, or 1 for a fresh index.
    pub async fn next_version_for_segment(
        pool: &SqlitePool,
        script_id: Uuid,
        segment_index: i64,
    ) -> Result<i64, sqlx::Error> {
        let (version,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(MAX(version), 0) + 1
            FROM scenes
            WHERE script_id = ?1 AND segment_index = ?2
            "#,
        )
        .bind(script_id)
        .bind(segment_index)
        .fetch_one(pool)
        .await?;

        Ok(version)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Scene>(r#"SELECT * FROM scenes WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}
