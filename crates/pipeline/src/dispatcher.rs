//! Durable-job dispatch. A bounded pool of workers claims jobs from the
//! queue table and wraps each stage invocation with status bookkeeping,
//! failure recording and next-step routing.
//!
//! Delivery is at-least-once: the queue re-delivers a job whose handler
//! errored, so correctness rests on the agents being safe to re-run, not
//! on this module providing exactly-once semantics.

use db::models::{
    audit_event::AuditEvent,
    pipeline_job::{PipelineJob, PipelineStep},
    project::Project,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::agents::{AgentContext, StageError, agent_for_step};

pub struct Dispatcher {
    ctx: AgentContext,
}

impl Dispatcher {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    /// Spawn the worker pool. Workers run until the process exits.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        (0..self.ctx.config.worker_count)
            .map(|worker| {
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    tracing::info!("[dispatcher] worker {worker} online");
                    Self::worker_loop(ctx).await;
                })
            })
            .collect()
    }

    async fn worker_loop(ctx: AgentContext) {
        loop {
            match PipelineJob::claim_next(&ctx.pool).await {
                Ok(Some(job)) => Self::handle_claimed(&ctx, job).await,
                Ok(None) => sleep(ctx.config.job_poll_interval()).await,
                Err(e) => {
                    tracing::error!("[dispatcher] claim failed: {e}");
                    sleep(ctx.config.job_poll_interval()).await;
                }
            }
        }
    }

    /// Process every due job until the queue is empty. Jobs enqueued by
    /// handlers along the way (auto-chaining) are picked up too.
    pub async fn drain(&self) -> Result<u32, sqlx::Error> {
        let mut processed = 0;
        while let Some(job) = PipelineJob::claim_next(&self.ctx.pool).await? {
            Self::handle_claimed(&self.ctx, job).await;
            processed += 1;
        }
        Ok(processed)
    }

    /// Run the handler and settle the delivery: completed, re-queued with a
    /// delay, or failed once its attempts are spent.
    async fn handle_claimed(ctx: &AgentContext, job: PipelineJob) {
        let step = job.step;
        match Self::handle_job(ctx, &job).await {
            Ok(()) => {
                if let Err(e) = PipelineJob::mark_completed(&ctx.pool, job.id).await {
                    tracing::error!("[dispatcher] failed to complete job {}: {e}", job.id);
                }
            }
            Err(e) => {
                tracing::error!(
                    "[dispatcher] {step} failed for project {} (attempt {}): {e}",
                    job.project_id,
                    job.attempts
                );
                let settle = if job.attempts >= ctx.config.job_max_attempts {
                    PipelineJob::mark_failed(&ctx.pool, job.id, &e.to_string()).await
                } else {
                    PipelineJob::requeue(
                        &ctx.pool,
                        job.id,
                        ctx.config.job_retry_delay_seconds,
                        &e.to_string(),
                    )
                    .await
                };
                if let Err(settle_err) = settle {
                    tracing::error!("[dispatcher] failed to settle job {}: {settle_err}", job.id);
                }
            }
        }
    }

    /// The stage handler contract: set the in-progress status, run the
    /// agent, then either park at the review gate, auto-chain the next
    /// step, or record the failure and re-throw for queue bookkeeping.
    async fn handle_job(ctx: &AgentContext, job: &PipelineJob) -> Result<(), StageError> {
        let step = job.step;
        let in_progress = step.in_progress_status();

        let project = Project::find_by_id(&ctx.pool, job.project_id)
            .await?
            .ok_or_else(|| {
                StageError::Validation(format!("Project {} not found", job.project_id))
            })?;

        // A redelivered job may find the project already in progress.
        if project.status != in_progress {
            Project::transition(&ctx.pool, job.project_id, in_progress).await?;
        }
        AuditEvent::record(
            &ctx.pool,
            job.project_id,
            step.as_str(),
            "stage_started",
            json!({ "attempt": job.attempts }),
        )
        .await;

        let agent = agent_for_step(ctx, step);
        match agent.run(job.project_id).await {
            Ok(report) => {
                AuditEvent::record(
                    &ctx.pool,
                    job.project_id,
                    step.as_str(),
                    "stage_completed",
                    json!({ "succeeded": report.succeeded, "failed": report.failed }),
                )
                .await;

                match step.review_gate() {
                    Some(gate) => {
                        Project::transition(&ctx.pool, job.project_id, gate).await?;
                    }
                    None => match step {
                        PipelineStep::VoiceSynthesis => {
                            let project = Project::find_by_id(&ctx.pool, job.project_id)
                                .await?
                                .ok_or_else(|| {
                                    StageError::Validation(format!(
                                        "Project {} not found",
                                        job.project_id
                                    ))
                                })?;
                            let next = if project.supplementary_enabled {
                                PipelineStep::Supplementary
                            } else {
                                PipelineStep::Editing
                            };
                            PipelineJob::enqueue(&ctx.pool, job.project_id, next, json!({}))
                                .await?;
                        }
                        PipelineStep::Editing => {
                            Project::transition(
                                &ctx.pool,
                                job.project_id,
                                db::models::project::ProjectStatus::Completed,
                            )
                            .await?;
                        }
                        _ => {}
                    },
                }
                Ok(())
            }
            Err(e) if e.is_cancelled() => {
                // A user abort is not a failure: leave the status and
                // error fields untouched, just note it on the trail.
                AuditEvent::record(
                    &ctx.pool,
                    job.project_id,
                    step.as_str(),
                    "stage_cancelled",
                    json!({}),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                if let Err(mark_err) =
                    Project::mark_failed(&ctx.pool, job.project_id, in_progress, &e.to_string())
                        .await
                {
                    tracing::error!(
                        "[dispatcher] could not record failure for {}: {mark_err}",
                        job.project_id
                    );
                }
                AuditEvent::record(
                    &ctx.pool,
                    job.project_id,
                    step.as_str(),
                    "stage_failed",
                    json!({ "error": e.to_string() }),
                )
                .await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        StubProvider, ensure_asset_dir, force_status, seed_project, seed_script, test_ctx,
        test_pool,
    };
    use db::models::{
        asset::{Asset, AssetKind},
        pipeline_job::JobStatus,
        project::ProjectStatus,
    };

    #[tokio::test]
    async fn test_successful_stage_parks_at_review_gate() {
        let stub = StubProvider::new();
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        seed_script(&pool, project.id).await;
        Project::set_influencer(&pool, project.id, "https://cdn.test/ref.png", "voice-1")
            .await
            .unwrap();
        force_status(&pool, project.id, ProjectStatus::InfluencerSelection).await;

        PipelineJob::enqueue(&pool, project.id, PipelineStep::Casting, json!({}))
            .await
            .unwrap();

        let ctx = test_ctx(pool, stub);
        let processed = Dispatcher::new(ctx.clone()).drain().await.unwrap();
        assert_eq!(processed, 1);

        let reloaded = Project::find_by_id(&ctx.pool, project.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, ProjectStatus::CastingReview);

        let portraits = Asset::find_by_kind(&ctx.pool, project.id, AssetKind::Portrait)
            .await
            .unwrap();
        assert_eq!(portraits.len(), 4);

        let jobs = PipelineJob::find_by_project(&ctx.pool, project.id)
            .await
            .unwrap();
        assert_eq!(jobs[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_redelivered_job_tolerates_in_progress_status() {
        let stub = StubProvider::new();
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        seed_script(&pool, project.id).await;
        Project::set_influencer(&pool, project.id, "https://cdn.test/ref.png", "voice-1")
            .await
            .unwrap();
        // as if a previous delivery died mid-stage
        force_status(&pool, project.id, ProjectStatus::Casting).await;

        PipelineJob::enqueue(&pool, project.id, PipelineStep::Casting, json!({}))
            .await
            .unwrap();

        let ctx = test_ctx(pool, stub);
        Dispatcher::new(ctx.clone()).drain().await.unwrap();

        let reloaded = Project::find_by_id(&ctx.pool, project.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, ProjectStatus::CastingReview);
    }

    #[tokio::test]
    async fn test_validation_failure_records_where_it_stopped() {
        let stub = StubProvider::new();
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        force_status(&pool, project.id, ProjectStatus::AnalysisReview).await;

        // scripting without an analysis: fails before any provider call
        PipelineJob::enqueue(&pool, project.id, PipelineStep::Scripting, json!({}))
            .await
            .unwrap();

        let ctx = test_ctx(pool, stub.clone());
        Dispatcher::new(ctx.clone()).drain().await.unwrap();

        let reloaded = Project::find_by_id(&ctx.pool, project.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, ProjectStatus::Failed);
        assert_eq!(reloaded.failed_at_status, Some(ProjectStatus::Scripting));
        assert!(reloaded.error_message.as_deref().unwrap().contains("analysis"));
        assert_eq!(stub.call_count(), 0);

        // attempts were spent (max 1 in the test config), so the job is dead
        let jobs = PipelineJob::find_by_project(&ctx.pool, project.id)
            .await
            .unwrap();
        assert_eq!(jobs[0].status, JobStatus::Failed);

        let failed_events = AuditEvent::list_by_type(&ctx.pool, project.id, "stage_failed")
            .await
            .unwrap();
        assert_eq!(failed_events.len(), 1);
    }

    #[tokio::test]
    async fn test_voice_auto_chains_through_supplementary_review() {
        ensure_asset_dir();
        let stub = StubProvider::new();
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        seed_script(&pool, project.id).await;
        Project::set_influencer(&pool, project.id, "https://cdn.test/ref.png", "voice-1")
            .await
            .unwrap();
        force_status(&pool, project.id, ProjectStatus::AssetReview).await;

        PipelineJob::enqueue(&pool, project.id, PipelineStep::VoiceSynthesis, json!({}))
            .await
            .unwrap();

        let ctx = test_ctx(pool, stub);
        // drain handles voice, then the auto-enqueued supplementary job
        let processed = Dispatcher::new(ctx.clone()).drain().await.unwrap();
        assert_eq!(processed, 2);

        let reloaded = Project::find_by_id(&ctx.pool, project.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, ProjectStatus::SupplementaryReview);
    }

    #[tokio::test]
    async fn test_cancelled_stage_leaves_no_failure_marks() {
        let stub = StubProvider::new();
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        seed_script(&pool, project.id).await;
        Project::set_influencer(&pool, project.id, "https://cdn.test/ref.png", "voice-1")
            .await
            .unwrap();
        force_status(&pool, project.id, ProjectStatus::InfluencerSelection).await;

        PipelineJob::enqueue(&pool, project.id, PipelineStep::Casting, json!({}))
            .await
            .unwrap();

        let ctx = test_ctx(pool, stub);
        ctx.cancel.cancel();
        Dispatcher::new(ctx.clone()).drain().await.unwrap();

        let reloaded = Project::find_by_id(&ctx.pool, project.id)
            .await
            .unwrap()
            .unwrap();
        // status reflects the interrupted stage; nothing reads as a failure
        assert_eq!(reloaded.status, ProjectStatus::Casting);
        assert!(reloaded.error_message.is_none());
        assert!(reloaded.failed_at_status.is_none());

        let cancelled = AuditEvent::list_by_type(&ctx.pool, project.id, "stage_cancelled")
            .await
            .unwrap();
        assert_eq!(cancelled.len(), 1);

        let jobs = PipelineJob::find_by_project(&ctx.pool, project.id)
            .await
            .unwrap();
        assert_eq!(jobs[0].status, JobStatus::Completed);
    }
}
