//! The review/recovery surface: the only ways a project leaves a review
//! gate or a failed state. Everything here moves along the same status
//! graph the stage handlers use; there is no side door.

use db::models::{
    audit_event::AuditEvent,
    pipeline_job::{PipelineJob, PipelineStep},
    project::{Project, ProjectError, ProjectStatus},
};
use serde_json::json;
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error("Project not found")]
    NotFound,
    #[error("Project is at {0}, not at a review gate")]
    NotAtReviewGate(ProjectStatus),
    #[error("The influencer-selection gate needs a selection, not an approval")]
    SelectionRequired,
    #[error("Project is at {0}, not failed")]
    NotFailed(ProjectStatus),
    #[error("Project has no recorded stage to recover")]
    NothingToRecover,
    #[error("No review gate precedes {0}")]
    NoPriorGate(ProjectStatus),
}

async fn load(pool: &SqlitePool, project_id: Uuid) -> Result<Project, RecoveryError> {
    Project::find_by_id(pool, project_id)
        .await?
        .ok_or(RecoveryError::NotFound)
}

/// Approve the current review gate. Returns the step that was enqueued,
/// or None when approval only advances to the next gate
/// (script review hands off to influencer selection).
pub async fn approve(
    pool: &SqlitePool,
    project_id: Uuid,
) -> Result<Option<PipelineStep>, RecoveryError> {
    let project = load(pool, project_id).await?;

    let enqueued = match project.status {
        ProjectStatus::AnalysisReview => Some(PipelineStep::Scripting),
        ProjectStatus::ScriptReview => {
            Project::transition(pool, project_id, ProjectStatus::InfluencerSelection).await?;
            None
        }
        ProjectStatus::InfluencerSelection => return Err(RecoveryError::SelectionRequired),
        ProjectStatus::CastingReview => Some(PipelineStep::Directing),
        ProjectStatus::AssetReview => Some(PipelineStep::VoiceSynthesis),
        ProjectStatus::SupplementaryReview => Some(PipelineStep::Editing),
        other => return Err(RecoveryError::NotAtReviewGate(other)),
    };

    if let Some(step) = enqueued {
        PipelineJob::enqueue(pool, project_id, step, json!({})).await?;
    }
    AuditEvent::record(
        pool,
        project_id,
        project.status.as_str(),
        "approved",
        json!({ "next_step": enqueued.map(|s| s.as_str()) }),
    )
    .await;

    Ok(enqueued)
}

/// Resolve the influencer-selection gate: record the chosen reference
/// image and voice, then kick off casting.
pub async fn select_influencer(
    pool: &SqlitePool,
    project_id: Uuid,
    influencer_image_url: &str,
    voice_id: &str,
) -> Result<(), RecoveryError> {
    let project = load(pool, project_id).await?;
    if project.status != ProjectStatus::InfluencerSelection {
        return Err(RecoveryError::NotAtReviewGate(project.status));
    }

    Project::set_influencer(pool, project_id, influencer_image_url, voice_id).await?;
    PipelineJob::enqueue(pool, project_id, PipelineStep::Casting, json!({})).await?;
    AuditEvent::record(
        pool,
        project_id,
        project.status.as_str(),
        "influencer_selected",
        json!({ "voice_id": voice_id }),
    )
    .await;

    Ok(())
}

/// Re-run the failed stage in place. The handler performs the
/// failed -> active transition (which also clears the error fields).
pub async fn retry(pool: &SqlitePool, project_id: Uuid) -> Result<PipelineStep, RecoveryError> {
    let project = load(pool, project_id).await?;
    if project.status != ProjectStatus::Failed {
        return Err(RecoveryError::NotFailed(project.status));
    }
    let failed_at = project
        .failed_at_status
        .ok_or(RecoveryError::NothingToRecover)?;
    let step = PipelineStep::for_status(failed_at).ok_or(RecoveryError::NothingToRecover)?;

    PipelineJob::enqueue(pool, project_id, step, json!({})).await?;
    AuditEvent::record(
        pool,
        project_id,
        failed_at.as_str(),
        "retry",
        json!({ "step": step.as_str() }),
    )
    .await;

    Ok(step)
}

/// Step back to the review gate before the current gate (or before the
/// stage the project failed at).
pub async fn rollback(pool: &SqlitePool, project_id: Uuid) -> Result<ProjectStatus, RecoveryError> {
    let project = load(pool, project_id).await?;

    let anchor = if project.status == ProjectStatus::Failed {
        project
            .failed_at_status
            .ok_or(RecoveryError::NothingToRecover)?
    } else if project.status.is_review_gate() {
        project.status
    } else {
        return Err(RecoveryError::NotAtReviewGate(project.status));
    };

    let prior = anchor
        .prior_review_gate()
        .ok_or(RecoveryError::NoPriorGate(anchor))?;
    Project::transition(pool, project_id, prior).await?;
    AuditEvent::record(
        pool,
        project_id,
        anchor.as_str(),
        "rollback",
        json!({ "to": prior.as_str() }),
    )
    .await;

    Ok(prior)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{force_status, seed_project, test_pool};
    use db::models::pipeline_job::JobStatus;

    #[tokio::test]
    async fn test_approve_enqueues_next_stage() {
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        force_status(&pool, project.id, ProjectStatus::AnalysisReview).await;

        let step = approve(&pool, project.id).await.unwrap();
        assert_eq!(step, Some(PipelineStep::Scripting));

        let jobs = PipelineJob::find_by_project(&pool, project.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].step, PipelineStep::Scripting);
        assert_eq!(jobs[0].status, JobStatus::Queued);

        // approval alone does not move the status; the handler does
        let reloaded = Project::find_by_id(&pool, project.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ProjectStatus::AnalysisReview);
    }

    #[tokio::test]
    async fn test_approve_script_review_steps_to_selection_gate() {
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        force_status(&pool, project.id, ProjectStatus::ScriptReview).await;

        let step = approve(&pool, project.id).await.unwrap();
        assert!(step.is_none());

        let reloaded = Project::find_by_id(&pool, project.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ProjectStatus::InfluencerSelection);
        assert!(
            PipelineJob::find_by_project(&pool, project.id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_approve_rejected_off_gate_and_at_selection() {
        let pool = test_pool().await;
        let project = seed_project(&pool).await;

        force_status(&pool, project.id, ProjectStatus::Directing).await;
        assert!(matches!(
            approve(&pool, project.id).await,
            Err(RecoveryError::NotAtReviewGate(ProjectStatus::Directing))
        ));

        force_status(&pool, project.id, ProjectStatus::InfluencerSelection).await;
        assert!(matches!(
            approve(&pool, project.id).await,
            Err(RecoveryError::SelectionRequired)
        ));
    }

    #[tokio::test]
    async fn test_select_influencer_records_and_enqueues_casting() {
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        force_status(&pool, project.id, ProjectStatus::InfluencerSelection).await;

        select_influencer(&pool, project.id, "https://cdn.test/mara.png", "voice-mara")
            .await
            .unwrap();

        let reloaded = Project::find_by_id(&pool, project.id).await.unwrap().unwrap();
        assert_eq!(
            reloaded.influencer_image_url.as_deref(),
            Some("https://cdn.test/mara.png")
        );
        assert_eq!(reloaded.voice_id.as_deref(), Some("voice-mara"));

        let jobs = PipelineJob::find_by_project(&pool, project.id).await.unwrap();
        assert_eq!(jobs[0].step, PipelineStep::Casting);
    }

    #[tokio::test]
    async fn test_retry_re_enqueues_failed_stage() {
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        force_status(&pool, project.id, ProjectStatus::Directing).await;
        Project::mark_failed(&pool, project.id, ProjectStatus::Directing, "provider 502")
            .await
            .unwrap();

        let step = retry(&pool, project.id).await.unwrap();
        assert_eq!(step, PipelineStep::Directing);

        let jobs = PipelineJob::find_by_project(&pool, project.id).await.unwrap();
        assert_eq!(jobs[0].step, PipelineStep::Directing);
    }

    #[tokio::test]
    async fn test_retry_requires_failed_status() {
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        force_status(&pool, project.id, ProjectStatus::AssetReview).await;

        assert!(matches!(
            retry(&pool, project.id).await,
            Err(RecoveryError::NotFailed(ProjectStatus::AssetReview))
        ));
    }

    #[tokio::test]
    async fn test_rollback_from_failure_reenters_prior_gate() {
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        force_status(&pool, project.id, ProjectStatus::Directing).await;
        Project::mark_failed(&pool, project.id, ProjectStatus::Directing, "provider 502")
            .await
            .unwrap();

        let gate = rollback(&pool, project.id).await.unwrap();
        assert_eq!(gate, ProjectStatus::CastingReview);

        let reloaded = Project::find_by_id(&pool, project.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ProjectStatus::CastingReview);
        // leaving failed clears the error bookkeeping
        assert!(reloaded.error_message.is_none());
        assert!(reloaded.failed_at_status.is_none());
    }

    #[tokio::test]
    async fn test_rollback_from_gate_steps_one_gate_back() {
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        force_status(&pool, project.id, ProjectStatus::AssetReview).await;

        let gate = rollback(&pool, project.id).await.unwrap();
        assert_eq!(gate, ProjectStatus::CastingReview);
    }

    #[tokio::test]
    async fn test_rollback_has_no_target_before_first_gate() {
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        force_status(&pool, project.id, ProjectStatus::AnalysisReview).await;

        assert!(matches!(
            rollback(&pool, project.id).await,
            Err(RecoveryError::NoPriorGate(ProjectStatus::AnalysisReview))
        ));
    }
}
