use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// Append-only trail of significant pipeline state changes.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub project_id: Uuid,
    pub stage: String,
    pub event_type: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    /// Best-effort insert. A failed audit write must never take down the
    /// stage that emitted it, so errors are logged and swallowed here.
    pub async fn record(
        pool: &SqlitePool,
        project_id: Uuid,
        stage: &str,
        event_type: &str,
        detail: Value,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_events (id, project_id, stage, event_type, detail)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(stage)
        .bind(event_type)
        .bind(detail.to_string())
        .execute(pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(
                "Failed to record audit event {event_type} for project {project_id}: {e}"
            );
        }
    }

    pub async fn list_by_project(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, AuditEvent>(
            r#"
            SELECT * FROM audit_events
            WHERE project_id = ?1
            ORDER BY created_at ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(pool)
        .await
    }

    pub async fn list_by_type(
        pool: &SqlitePool,
        project_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, AuditEvent>(
            r#"
            SELECT * FROM audit_events
            WHERE project_id = ?1 AND event_type = ?2
            ORDER BY created_at ASC
            "#,
        )
        .bind(project_id)
        .bind(event_type)
        .fetch_all(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_utils::{setup_test_pool, test_project};
    use serde_json::json;

    #[tokio::test]
    async fn test_record_and_list() {
        let pool = setup_test_pool().await;
        let project = test_project(&pool).await;

        AuditEvent::record(
            &pool,
            project.id,
            "casting",
            "stage_completed",
            json!({"succeeded": 3, "failed": 1}),
        )
        .await;

        let events = AuditEvent::list_by_project(&pool, project.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "stage_completed");
        let detail: Value = serde_json::from_str(events[0].detail.as_deref().unwrap()).unwrap();
        assert_eq!(detail["succeeded"], 3);
    }
}
