//! Shared fixtures for the pipeline tests: an in-memory database and a
//! scriptable stub implementation of the provider trait.

use std::collections::{HashSet, VecDeque};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use db::models::{
    project::{CreateProject, Project, ProjectStatus},
    scene::{CreateScene, Scene},
    script::Script,
};
use providers::{
    ChatOptions, GenerationProvider, ImageOptions, Polled, PollOptions, ProviderError,
    RenderHandle, RenderModification, TaskHandle, TaskOutput, VideoRequest,
};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{agents::AgentContext, config::PipelineConfig};

/// Scriptable provider double. Submissions are numbered in call order so
/// tests can fail specific units; chat responses are served FIFO.
#[derive(Default)]
pub(crate) struct StubProvider {
    pub chat_responses: Mutex<VecDeque<String>>,
    pub failing_submissions: Mutex<HashSet<usize>>,
    pub submissions: AtomicUsize,
    pub edit_image_refs: Mutex<Vec<Vec<String>>>,
    pub calls: Mutex<Vec<String>>,
}

impl StubProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_chat(responses: &[&str]) -> Arc<Self> {
        let stub = Self::default();
        *stub.chat_responses.lock().unwrap() =
            responses.iter().map(|s| s.to_string()).collect();
        Arc::new(stub)
    }

    pub fn fail_submissions(&self, indices: &[usize]) {
        self.failing_submissions
            .lock()
            .unwrap()
            .extend(indices.iter().copied());
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn next_task(&self) -> Result<TaskHandle, ProviderError> {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst);
        if self.failing_submissions.lock().unwrap().contains(&n) {
            return Err(ProviderError::Api {
                status: 500,
                message: format!("submission {n} rejected"),
            });
        }
        Ok(TaskHandle {
            task_id: format!("task-{n}"),
        })
    }
}

#[async_trait]
impl GenerationProvider for StubProvider {
    async fn chat_completion(
        &self,
        _system: &str,
        _user: &str,
        _opts: &ChatOptions,
    ) -> Result<String, ProviderError> {
        self.record("chat_completion");
        self.chat_responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(ProviderError::EmptyResponse)
    }

    async fn generate_image(
        &self,
        _prompt: &str,
        _opts: &ImageOptions,
    ) -> Result<TaskHandle, ProviderError> {
        self.record("generate_image");
        self.next_task()
    }

    async fn edit_image(
        &self,
        reference_urls: &[String],
        _prompt: &str,
        _opts: &ImageOptions,
    ) -> Result<TaskHandle, ProviderError> {
        self.record("edit_image");
        self.edit_image_refs
            .lock()
            .unwrap()
            .push(reference_urls.to_vec());
        self.next_task()
    }

    async fn generate_video(&self, _request: &VideoRequest) -> Result<TaskHandle, ProviderError> {
        self.record("generate_video");
        self.next_task()
    }

    async fn poll_task(
        &self,
        task_id: &str,
        opts: &PollOptions,
    ) -> Result<Polled, ProviderError> {
        self.record("poll_task");
        if opts.check_cancelled() {
            return Ok(Polled::Cancelled);
        }
        Ok(Polled::Completed(TaskOutput {
            url: format!("https://cdn.test/{task_id}.png"),
        }))
    }

    async fn text_to_speech(&self, _voice_id: &str, _text: &str) -> Result<Vec<u8>, ProviderError> {
        self.record("text_to_speech");
        Ok(vec![0x49, 0x44, 0x33])
    }

    async fn render_composite(
        &self,
        _template_id: &str,
        _modifications: &[RenderModification],
    ) -> Result<RenderHandle, ProviderError> {
        self.record("render_composite");
        self.next_task().map(|handle| RenderHandle {
            render_id: handle.task_id,
        })
    }

    async fn poll_render(
        &self,
        render_id: &str,
        opts: &PollOptions,
    ) -> Result<Polled, ProviderError> {
        self.record("poll_render");
        if opts.check_cancelled() {
            return Ok(Polled::Cancelled);
        }
        Ok(Polled::Completed(TaskOutput {
            url: format!("https://cdn.test/{render_id}.mp4"),
        }))
    }
}

pub(crate) async fn test_pool() -> SqlitePool {
    db::models::test_utils::setup_test_pool().await
}

/// Config with all delays zeroed and retries off, so unit indices map 1:1
/// onto submission indices.
pub(crate) fn test_config() -> PipelineConfig {
    PipelineConfig {
        unit_retry_attempts: 0,
        unit_retry_delay_secs: 0,
        job_retry_delay_seconds: 0,
        job_max_attempts: 1,
        ..PipelineConfig::default()
    }
}

pub(crate) fn test_ctx(pool: SqlitePool, provider: Arc<StubProvider>) -> AgentContext {
    AgentContext::new(pool, provider, Arc::new(test_config()))
}

pub(crate) async fn seed_project(pool: &SqlitePool) -> Project {
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
    .expect("seed project")
}

pub(crate) async fn seed_script(pool: &SqlitePool, project_id: Uuid) -> (Script, Vec<Scene>) {
    let script = Script::create(pool, Uuid::new_v4(), project_id, 1, "full text")
        .await
        .expect("seed script");
    let mut scenes = Vec::new();
    for index in 0..4 {
        let scene = Scene::create(
            pool,
            Uuid::new_v4(),
            &CreateScene {
                script_id: script.id,
                segment_index: index,
                version: 1,
                title: Some(format!("Segment {index}")),
                visual_description: format!("wide shot {index}"),
                dialogue: format!("line {index}"),
                arc: None,
            },
        )
        .await
        .expect("seed scene");
        scenes.push(scene);
    }
    (script, scenes)
}

/// Point the asset directory at one shared tempdir for the whole test
/// process; set_var is process-global, so it must only happen once.
pub(crate) fn ensure_asset_dir() -> &'static std::path::Path {
    use std::sync::OnceLock;
    static DIR: OnceLock<tempfile::TempDir> = OnceLock::new();
    let dir = DIR.get_or_init(|| {
        let dir = tempfile::tempdir().expect("tempdir");
        unsafe { std::env::set_var("BACKLOT_ASSET_DIR", dir.path()) };
        dir
    });
    dir.path()
}

pub(crate) async fn force_status(pool: &SqlitePool, project_id: Uuid, status: ProjectStatus) {
    sqlx::query("UPDATE projects SET status = ?1 WHERE id = ?2")
        .bind(status)
        .bind(project_id)
        .execute(pool)
        .await
        .expect("force status");
}
