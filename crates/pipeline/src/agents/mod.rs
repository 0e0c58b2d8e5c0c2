//! The shared shape every stage implementation follows: fetch inputs,
//! submit external work, poll to completion, persist, track cost, emit
//! audit events. Stage agents are narrow (one `run` entry point) and
//! depend on injected collaborators plus the free functions in this
//! module, not on a shared base type.

pub mod analysis;
pub mod casting;
pub mod directing;
pub mod editing;
pub mod scripting;
pub mod supplementary;
pub mod voice;

use std::sync::Arc;

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use db::models::{
    asset::{Asset, AssetKind, CreateAsset},
    audit_event::AuditEvent,
    pipeline_job::PipelineStep,
    project::{Project, ProjectError},
    scene::Scene,
    script::Script,
};
use providers::{
    ChatOptions, GenerationProvider, Polled, PollOptions, ProviderError, TaskHandle,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    config::PipelineConfig,
    continuity::BatchReport,
    parser::{self, ParseOutcome},
};

pub use providers::CancelFlag;

#[derive(Debug, Error)]
pub enum StageError {
    /// Missing prerequisite data; raised before any external call.
    #[error("Missing prerequisite: {0}")]
    Validation(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Both the original response and the single stricter retry were
    /// unparseable. The raw payloads live in `parse_failure` audit events.
    #[error("Structured output unparseable after retry (first: {first}; retry: {second})")]
    Parse { first: String, second: String },
    #[error("All {total} work units failed")]
    BatchFailed { total: usize },
    /// User-initiated abort. Never recorded as a stage failure and never
    /// written to `error_message`.
    #[error("Run cancelled")]
    Cancelled,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StageError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Cancelled)
    }
}

/// Collaborators handed to every agent. Nothing here is ambient: the pool,
/// provider, config and cancellation flag are injected at construction.
#[derive(Clone)]
pub struct AgentContext {
    pub pool: SqlitePool,
    pub provider: Arc<dyn GenerationProvider>,
    pub config: Arc<PipelineConfig>,
    pub cancel: CancelFlag,
}

impl AgentContext {
    pub fn new(
        pool: SqlitePool,
        provider: Arc<dyn GenerationProvider>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            pool,
            provider,
            config,
            cancel: CancelFlag::new(),
        }
    }

    pub fn poll_options(&self, settings: crate::config::PollSettings) -> PollOptions {
        settings.options().with_cancel(self.cancel.clone())
    }
}

#[async_trait]
pub trait StageAgent: Send + Sync {
    fn step(&self) -> PipelineStep;

    /// Execute the stage for one project. Safe to re-run: job delivery is
    /// at-least-once.
    async fn run(&self, project_id: Uuid) -> Result<BatchReport, StageError>;
}

pub fn agent_for_step(ctx: &AgentContext, step: PipelineStep) -> Box<dyn StageAgent> {
    match step {
        PipelineStep::Analysis => Box::new(analysis::AnalysisAgent::new(ctx.clone())),
        PipelineStep::Scripting => Box::new(scripting::ScriptingAgent::new(ctx.clone())),
        PipelineStep::Casting => Box::new(casting::CastingAgent::new(ctx.clone())),
        PipelineStep::Directing => Box::new(directing::DirectingAgent::new(ctx.clone())),
        PipelineStep::VoiceSynthesis => Box::new(voice::VoiceAgent::new(ctx.clone())),
        PipelineStep::Supplementary => {
            Box::new(supplementary::SupplementaryAgent::new(ctx.clone()))
        }
        PipelineStep::Editing => Box::new(editing::EditingAgent::new(ctx.clone())),
    }
}

// ---- Free helpers shared by the agents ----

pub(crate) async fn load_project(
    ctx: &AgentContext,
    project_id: Uuid,
) -> Result<Project, StageError> {
    Project::find_by_id(&ctx.pool, project_id)
        .await?
        .ok_or_else(|| StageError::Validation(format!("Project {project_id} not found")))
}

/// The current script and its scene view, or a validation error when the
/// stage has nothing to work on.
pub(crate) async fn load_current_scenes(
    ctx: &AgentContext,
    project_id: Uuid,
) -> Result<(Script, Vec<Scene>), StageError> {
    let script = Script::find_current(&ctx.pool, project_id)
        .await?
        .ok_or_else(|| StageError::Validation(format!("Project {project_id} has no script")))?;
    let scenes = Scene::current_view(&ctx.pool, script.id).await?;
    if scenes.is_empty() {
        return Err(StageError::Validation(format!(
            "Script {} has no scenes",
            script.id
        )));
    }
    Ok((script, scenes))
}

/// Best-effort cost tracking through the atomic ledger increment. A ledger
/// write failure is logged, never escalated: cost accounting must not
/// take down a stage that already paid for the work.
pub(crate) async fn track_cost(ctx: &AgentContext, project_id: Uuid, amount_usd: f64, stage: &str) {
    if amount_usd <= 0.0 {
        return;
    }
    match Project::increment_cost(&ctx.pool, project_id, amount_usd).await {
        Ok(total) => {
            tracing::debug!("[{stage}] tracked ${amount_usd:.4} for {project_id} (total ${total:.4})");
        }
        Err(e) => {
            tracing::warn!("[{stage}] failed to track ${amount_usd:.4} for {project_id}: {e}");
        }
    }
}

/// Submit with flat-delay unit retries, then poll to a terminal state and
/// persist the outcome as an Asset.
///
/// The asset row is created as soon as submission succeeds (generating),
/// and resolved to completed or failed. A submission that exhausts its
/// retries still leaves a failed asset behind so the batch report and the
/// progress read model see the unit. Cancellation propagates as
/// `StageError::Cancelled` and leaves the in-flight asset generating,
/// since the remote task is still outstanding.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn submit_poll_persist<F, Fut>(
    ctx: &AgentContext,
    project_id: Uuid,
    scene_id: Option<Uuid>,
    kind: AssetKind,
    submit: F,
    poll: &PollOptions,
    cost_usd: f64,
    stage: &str,
) -> Result<String, StageError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<TaskHandle, ProviderError>>,
{
    let handle = submit
        .retry(
            &ConstantBuilder::default()
                .with_delay(ctx.config.unit_retry_delay())
                .with_max_times(ctx.config.unit_retry_attempts),
        )
        .notify(|err: &ProviderError, dur| {
            tracing::warn!("[{stage}] submission failed, retrying after {dur:?}: {err}");
        })
        .await;

    let handle = match handle {
        Ok(handle) => handle,
        Err(e) => {
            let asset = Asset::create(
                &ctx.pool,
                Uuid::new_v4(),
                &CreateAsset {
                    project_id,
                    scene_id,
                    kind,
                    provider: None,
                    provider_task_id: None,
                    metadata: Some(json!({ "error": e.to_string() }).to_string()),
                },
            )
            .await?;
            Asset::mark_failed(
                &ctx.pool,
                asset.id,
                &json!({ "error": e.to_string() }).to_string(),
            )
            .await?;
            return Err(e.into());
        }
    };

    let asset = Asset::create(
        &ctx.pool,
        Uuid::new_v4(),
        &CreateAsset {
            project_id,
            scene_id,
            kind,
            provider: Some("http".to_string()),
            provider_task_id: Some(handle.task_id.clone()),
            metadata: None,
        },
    )
    .await?;

    match ctx.provider.poll_task(&handle.task_id, poll).await {
        Ok(Polled::Completed(output)) => {
            Asset::mark_completed(&ctx.pool, asset.id, &output.url, cost_usd).await?;
            track_cost(ctx, project_id, cost_usd, stage).await;
            Ok(output.url)
        }
        Ok(Polled::Cancelled) => Err(StageError::Cancelled),
        Err(e) => {
            Asset::mark_failed(
                &ctx.pool,
                asset.id,
                &json!({ "error": e.to_string(), "task_id": handle.task_id }).to_string(),
            )
            .await?;
            Err(e.into())
        }
    }
}

/// Record one unit's failure without aborting siblings: failed asset rows
/// were already written by the unit itself, this adds the audit trail.
pub(crate) async fn record_unit_failure(
    ctx: &AgentContext,
    project_id: Uuid,
    stage: &str,
    segment_index: i64,
    error: &StageError,
) {
    AuditEvent::record(
        &ctx.pool,
        project_id,
        stage,
        "segment_error",
        json!({ "segment_index": segment_index, "error": error.to_string() }),
    )
    .await;
}

/// One chat completion expected to yield a JSON array, run through the
/// repair parser, with the caller policy on failure: persist the raw
/// payload, re-ask once with stricter formatting instructions at low
/// temperature, and give up with a composite error if that fails too.
pub(crate) async fn chat_structured<T: DeserializeOwned>(
    ctx: &AgentContext,
    project_id: Uuid,
    stage: &str,
    system: &str,
    user: &str,
    wrapper_keys: &[&str],
) -> Result<Vec<T>, StageError> {
    let opts = ChatOptions {
        model: ctx.config.chat_model.clone(),
        temperature: ctx.config.chat_temperature,
        ..ChatOptions::default()
    };
    let raw = ctx.provider.chat_completion(system, user, &opts).await?;
    track_cost(ctx, project_id, ctx.config.cost.chat_call, stage).await;

    let first_error = match parser::parse_array_of::<T>(&raw, wrapper_keys) {
        ParseOutcome::Clean(items) => return Ok(items),
        ParseOutcome::Repaired(items) => {
            tracing::debug!("[{stage}] structured output needed repair for {project_id}");
            return Ok(items);
        }
        ParseOutcome::Failed { error, raw } => {
            AuditEvent::record(
                &ctx.pool,
                project_id,
                stage,
                "parse_failure",
                json!({ "attempt": 1, "error": &error, "raw": &raw }),
            )
            .await;
            error
        }
    };

    let strict_system = format!(
        "{system}\n\nReturn ONLY valid JSON. No markdown fences, no comments, no trailing commas."
    );
    let strict_opts = ChatOptions {
        model: ctx.config.chat_model.clone(),
        temperature: ctx.config.strict_temperature,
        ..ChatOptions::default()
    };
    let retry_raw = ctx
        .provider
        .chat_completion(&strict_system, user, &strict_opts)
        .await?;
    track_cost(ctx, project_id, ctx.config.cost.chat_call, stage).await;

    match parser::parse_array_of::<T>(&retry_raw, wrapper_keys) {
        ParseOutcome::Clean(items) | ParseOutcome::Repaired(items) => Ok(items),
        ParseOutcome::Failed { error, raw } => {
            AuditEvent::record(
                &ctx.pool,
                project_id,
                stage,
                "parse_failure",
                json!({ "attempt": 2, "error": &error, "raw": &raw }),
            )
            .await;
            Err(StageError::Parse {
                first: first_error,
                second: error,
            })
        }
    }
}
