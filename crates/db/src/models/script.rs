use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// One immutable draft of a project's script. Versions only accumulate;
/// the highest version is the current one.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Script {
    pub id: Uuid,
    pub project_id: Uuid,
    pub version: i64,
    pub full_text: String,
    pub created_at: DateTime<Utc>,
}

impl Script {
    pub async fn create(
        pool: &SqlitePool,
        script_id: Uuid,
        project_id: Uuid,
        version: i64,
        full_text: &str,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Script>(
            r#"
            INSERT INTO scripts (id, project_id, version, full_text)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING *
            "#,
        )
        .bind(script_id)
        .bind(project_id)
        .bind(version)
        .bind(full_text)
        .fetch_one(pool)
        .await
    }

    /// `max(existing versions) + 1`, or 1 when the project has no script yet.
    pub async fn next_version(pool: &SqlitePool, project_id: Uuid) -> Result<i64, sqlx::Error> {
        let (version,): (i64,) = sqlx::query_as(
            r#"SELECT COALESCE(MAX(version), 0) + 1 FROM scripts WHERE project_id = ?1"#,
        )
        .bind(project_id)
        .fetch_one(pool)
        .await?;

        Ok(version)
    }

    pub async fn find_current(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Script>(
            r#"
            SELECT * FROM scripts
            WHERE project_id = ?1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(project_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Script>(r#"SELECT * FROM scripts WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_utils::{setup_test_pool, test_project};

    #[tokio::test]
    async fn test_next_version_starts_at_one() {
        let pool = setup_test_pool().await;
        let project = test_project(&pool).await;
        assert_eq!(Script::next_version(&pool, project.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_next_version_is_max_plus_one() {
        let pool = setup_test_pool().await;
        let project = test_project(&pool).await;

        for version in 1..=3 {
            Script::create(&pool, Uuid::new_v4(), project.id, version, "draft")
                .await
                .unwrap();
        }

        assert_eq!(Script::next_version(&pool, project.id).await.unwrap(), 4);

        let current = Script::find_current(&pool, project.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.version, 3);
    }
}
