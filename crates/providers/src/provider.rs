//! The seam between the pipeline and external generation vendors.
//!
//! Stage agents only ever see this trait; the concrete wire protocol lives
//! behind it. Async tasks (images, video, renders) are submitted for a
//! handle and then polled to a terminal state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("Provider returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Task {task_id} did not finish within {waited_secs}s")]
    Timeout { task_id: String, waited_secs: u64 },
    #[error("Task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },
    #[error("Provider returned an empty completion")]
    EmptyResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature: 0.8,
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageOptions {
    pub aspect_ratio: Option<String>,
    pub negative_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRequest {
    pub prompt: String,
    pub first_frame_url: Option<String>,
    pub last_frame_url: Option<String>,
    pub duration_seconds: u32,
}

/// Handle for a submitted asynchronous generation task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderHandle {
    pub render_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub url: String,
}

/// One key/value override applied to a render template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderModification {
    pub name: String,
    pub value: String,
}

/// Cooperative cancellation for a stage run. Poll loops consult the flag
/// once per iteration; a raised flag surfaces as [`Polled::Cancelled`],
/// which is a result variant rather than an error so callers cannot
/// mistake an abort for a failure.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Hard ceiling on the total wait; exceeding it is the unit's failure.
    pub max_wait: Duration,
    pub interval: Duration,
    pub cancel: Option<CancelFlag>,
}

impl PollOptions {
    pub fn new(max_wait: Duration, interval: Duration) -> Self {
        Self {
            max_wait,
            interval,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    /// True when the poll loop should stop with `Polled::Cancelled`.
    pub fn check_cancelled(&self) -> bool {
        self.cancelled()
    }
}

#[derive(Debug, Clone)]
pub enum Polled {
    Completed(TaskOutput),
    Cancelled,
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn chat_completion(
        &self,
        system: &str,
        user: &str,
        opts: &ChatOptions,
    ) -> Result<String, ProviderError>;

    async fn generate_image(
        &self,
        prompt: &str,
        opts: &ImageOptions,
    ) -> Result<TaskHandle, ProviderError>;

    /// Image generation conditioned on reference images; used for identity
    /// continuity across segments.
    async fn edit_image(
        &self,
        reference_urls: &[String],
        prompt: &str,
        opts: &ImageOptions,
    ) -> Result<TaskHandle, ProviderError>;

    async fn generate_video(&self, request: &VideoRequest) -> Result<TaskHandle, ProviderError>;

    async fn poll_task(&self, task_id: &str, opts: &PollOptions)
    -> Result<Polled, ProviderError>;

    async fn text_to_speech(&self, voice_id: &str, text: &str) -> Result<Vec<u8>, ProviderError>;

    async fn render_composite(
        &self,
        template_id: &str,
        modifications: &[RenderModification],
    ) -> Result<RenderHandle, ProviderError>;

    async fn poll_render(
        &self,
        render_id: &str,
        opts: &PollOptions,
    ) -> Result<Polled, ProviderError>;
}
