//! Analysis stage: one chat completion that breaks the project brief into
//! per-segment narrative beats, stored on the project for the scripting
//! stage to build on.

use async_trait::async_trait;
use db::models::{audit_event::AuditEvent, pipeline_job::PipelineStep, project::Project};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::continuity::BatchReport;

use super::{AgentContext, StageAgent, StageError, chat_structured, load_project};

const STAGE: &str = "analysis";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentBeat {
    #[serde(default)]
    pub segment_index: Option<i64>,
    #[serde(default)]
    pub arc: Option<String>,
    pub synopsis: String,
}

pub struct AnalysisAgent {
    ctx: AgentContext,
}

impl AnalysisAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl StageAgent for AnalysisAgent {
    fn step(&self) -> PipelineStep {
        PipelineStep::Analysis
    }

    async fn run(&self, project_id: Uuid) -> Result<BatchReport, StageError> {
        let project = load_project(&self.ctx, project_id).await?;
        let arcs = project.segment_arc_list();

        let system = "You are a short-form video story analyst. Break a brief into \
                      per-segment narrative beats and respond with a JSON array.";
        let user = format!(
            "Brief: {title}\n\
             Segments: {count} x {duration}s\n\
             Arc labels, in order: {arcs:?}\n\n\
             For every segment return an object with segment_index, arc and synopsis \
             (one or two sentences of what happens on screen). \
             Respond as {{\"segments\": [...]}}.",
            title = project.title,
            count = project.segment_count,
            duration = project.segment_duration_seconds,
        );

        let beats: Vec<SegmentBeat> = chat_structured(
            &self.ctx,
            project_id,
            STAGE,
            system,
            &user,
            &["segments", "beats"],
        )
        .await?;

        if beats.is_empty() {
            return Err(StageError::Validation(
                "Analysis returned zero segments".to_string(),
            ));
        }

        let analysis = serde_json::to_string(&beats)
            .map_err(|e| StageError::Validation(format!("Analysis not serializable: {e}")))?;
        Project::set_analysis(&self.ctx.pool, project_id, &analysis).await?;

        AuditEvent::record(
            &self.ctx.pool,
            project_id,
            STAGE,
            "analysis_stored",
            json!({ "segments": beats.len() }),
        )
        .await;

        let mut report = BatchReport::default();
        report.record_success();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubProvider, seed_project, test_ctx, test_pool};

    #[tokio::test]
    async fn test_analysis_stored_on_project() {
        let beats = r#"{"segments":[
            {"segment_index":0,"arc":"setup","synopsis":"Dunes at dawn."},
            {"segment_index":1,"arc":"rise","synopsis":"The climb begins."},
            {"segment_index":2,"arc":"peak","synopsis":"Summit."},
            {"segment_index":3,"arc":"outro","synopsis":"Walk-off."}
        ]}"#;
        let stub = StubProvider::with_chat(&[beats]);
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        let ctx = test_ctx(pool, stub);

        let report = AnalysisAgent::new(ctx.clone()).run(project.id).await.unwrap();
        assert_eq!((report.succeeded, report.failed), (1, 0));

        let reloaded = Project::find_by_id(&ctx.pool, project.id)
            .await
            .unwrap()
            .unwrap();
        let stored: Vec<SegmentBeat> =
            serde_json::from_str(reloaded.analysis.as_deref().unwrap()).unwrap();
        assert_eq!(stored.len(), 4);
        assert_eq!(stored[2].synopsis, "Summit.");

        // one chat call was billed
        assert!((reloaded.cost_usd - ctx.config.cost.chat_call).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_empty_analysis_is_an_error() {
        let stub = StubProvider::with_chat(&["[]", "[]"]);
        let pool = test_pool().await;
        let project = seed_project(&pool).await;
        let ctx = test_ctx(pool, stub);

        let result = AnalysisAgent::new(ctx).run(project.id).await;
        assert!(matches!(result, Err(StageError::Validation(_))));
    }
}
