//! Scripting stage: turns the analysis into a fully versioned script.
//!
//! A full run always appends a new script version with fresh scene rows;
//! `regenerate_segment` appends a higher-version row for a single segment
//! of the current script. Nothing is ever mutated in place.

use async_trait::async_trait;
use db::models::{
    audit_event::AuditEvent,
    pipeline_job::PipelineStep,
    scene::{CreateScene, Scene},
    script::Script,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::continuity::BatchReport;

use super::{AgentContext, StageAgent, StageError, chat_structured, load_current_scenes, load_project};

const STAGE: &str = "scripting";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneDraft {
    #[serde(default)]
    pub title: Option<String>,
    pub visual_description: String,
    pub dialogue: String,
    #[serde(default)]
    pub arc: Option<String>,
}

pub struct ScriptingAgent {
    ctx: AgentContext,
}

impl ScriptingAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    fn full_text(drafts: &[SceneDraft]) -> String {
        drafts
            .iter()
            .enumerate()
            .map(|(i, draft)| {
                let title = draft
                    .title
                    .clone()
                    .unwrap_or_else(|| format!("Segment {}", i + 1));
                format!("## {title}\n{}\n\n{}", draft.visual_description, draft.dialogue)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Append a new version of one segment on the current script. Used by
    /// the manual regeneration surface, outside the stage run itself.
    pub async fn regenerate_segment(
        &self,
        project_id: Uuid,
        segment_index: i64,
    ) -> Result<Scene, StageError> {
        let project = load_project(&self.ctx, project_id).await?;
        let (script, scenes) = load_current_scenes(&self.ctx, project_id).await?;
        let current = scenes
            .iter()
            .find(|s| s.segment_index == segment_index)
            .ok_or_else(|| {
                StageError::Validation(format!("Segment {segment_index} has no current scene"))
            })?;

        let system = "You are the head writer of a short-form video studio. \
                      Rewrite a single segment of an existing script. \
                      Respond with a JSON array holding exactly one scene object.";
        let user = format!(
            "Project: {title}\n\
             Segment {segment_index} of {count}, {duration}s.\n\
             Current visual: {visual}\n\
             Current dialogue: {dialogue}\n\n\
             Write an improved replacement. Each scene object has title, \
             visual_description, dialogue and arc. Respond as {{\"scenes\": [...]}}.",
            title = project.title,
            count = project.segment_count,
            duration = project.segment_duration_seconds,
            visual = current.visual_description,
            dialogue = current.dialogue,
        );

        let mut drafts: Vec<SceneDraft> =
            chat_structured(&self.ctx, project_id, STAGE, system, &user, &["scenes"]).await?;
        let draft = if drafts.is_empty() {
            return Err(StageError::Validation(
                "Regeneration returned zero scenes".to_string(),
            ));
        } else {
            drafts.remove(0)
        };

        let version =
            Scene::next_version_for_segment(&self.ctx.pool, script.id, segment_index).await?;
        let scene = Scene::create(
            &self.ctx.pool,
            Uuid::new_v4(),
            &CreateScene {
                script_id: script.id,
                segment_index,
                version,
                title: draft.title,
                visual_description: draft.visual_description,
                dialogue: draft.dialogue,
                arc: draft.arc,
            },
        )
        .await?;

        AuditEvent::record(
            &self.ctx.pool,
            project_id,
            STAGE,
            "segment_regenerated",
            json!({ "segment_index": segment_index, "version": version }),
        )
        .await;

        Ok(scene)
    }
}

#[async_trait]
impl StageAgent for ScriptingAgent {
    fn step(&self) -> PipelineStep {
        PipelineStep::Scripting
    }

    async fn run(&self, project_id: Uuid) -> Result<BatchReport, StageError> {
        let project = load_project(&self.ctx, project_id).await?;
        let analysis = project.analysis.clone().ok_or_else(|| {
            StageError::Validation(format!("Project {project_id} has no analysis"))
        })?;
        let arcs = project.segment_arc_list();

        let system = "You are the head writer of a short-form video studio. \
                      Write a segmented script and respond with a JSON array of scenes.";
        let user = format!(
            "Project: {title}\n\
             Exactly {count} scenes, one per segment, each {duration}s on screen.\n\
             Narrative beats: {analysis}\n\n\
             Each scene object has title, visual_description (what the camera sees), \
             dialogue (the spoken line) and arc. Respond as {{\"scenes\": [...]}}.",
            title = project.title,
            count = project.segment_count,
            duration = project.segment_duration_seconds,
        );

        let mut drafts: Vec<SceneDraft> = chat_structured(
            &self.ctx,
            project_id,
            STAGE,
            system,
            &user,
            &["scenes", "segments"],
        )
        .await?;

        if drafts.is_empty() {
            return Err(StageError::Validation(
                "Scripting returned zero scenes".to_string(),
            ));
        }
        drafts.truncate(project.segment_count as usize);

        let version = Script::next_version(&self.ctx.pool, project_id).await?;
        let script = Script::create(
            &self.ctx.pool,
            Uuid::new_v4(),
            project_id,
            version,
            &Self::full_text(&drafts),
        )
        .await?;

        let scene_count = drafts.len();
        for (index, draft) in drafts.into_iter().enumerate() {
            let arc = draft.arc.or_else(|| arcs.get(index).cloned());
            Scene::create(
                &self.ctx.pool,
                Uuid::new_v4(),
                &CreateScene {
                    script_id: script.id,
                    segment_index: index as i64,
                    version: 1,
                    title: draft.title,
                    visual_description: draft.visual_description,
                    dialogue: draft.dialogue,
                    arc,
                },
            )
            .await?;
        }

        AuditEvent::record(
            &self.ctx.pool,
            project_id,
            STAGE,
            "script_created",
            json!({ "version": version, "scenes": scene_count }),
        )
        .await;

        let mut report = BatchReport::default();
        report.record_success();
        Ok(report)
    }
}
