//! HTTP implementation of [`GenerationProvider`] against a generic JSON
//! task contract: submissions return `{ "task_id": ... }`, task and render
//! status endpoints return `{ "status", "url", "error" }`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;

use crate::provider::{
    ChatOptions, GenerationProvider, ImageOptions, Polled, PollOptions, ProviderError,
    RenderHandle, RenderModification, TaskHandle, TaskOutput, VideoRequest,
};

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub llm_base_url: String,
    pub media_base_url: String,
    pub tts_base_url: String,
    pub render_base_url: String,
    pub api_key: Option<String>,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            llm_base_url: std::env::var("BACKLOT_LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".into()),
            media_base_url: std::env::var("BACKLOT_MEDIA_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8800".into()),
            tts_base_url: std::env::var("BACKLOT_TTS_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8801".into()),
            render_base_url: std::env::var("BACKLOT_RENDER_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8802".into()),
            api_key: std::env::var("BACKLOT_PROVIDER_API_KEY").ok(),
        }
    }
}

pub struct HttpGenerationProvider {
    client: Client,
    config: HttpProviderConfig,
}

impl HttpGenerationProvider {
    pub fn new(config: HttpProviderConfig) -> Self {
        if config.api_key.is_none() {
            tracing::warn!(
                "Generation provider initialized without an API key - BACKLOT_PROVIDER_API_KEY not set"
            );
        }
        Self {
            client: Client::new(),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(HttpProviderConfig::default())
    }

    fn endpoint(base: &str, path: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn submit(
        &self,
        url: String,
        body: serde_json::Value,
    ) -> Result<SubmitResponse, ProviderError> {
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Api {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json::<SubmitResponse>().await?)
    }

    /// Shared poll loop for tasks and renders. One await boundary per
    /// iteration; the cancellation flag is consulted only at iteration
    /// boundaries, and a raised flag is a result, never an error.
    async fn poll_status(
        &self,
        status_url: String,
        id: &str,
        opts: &PollOptions,
    ) -> Result<Polled, ProviderError> {
        let started = Instant::now();
        loop {
            if opts.check_cancelled() {
                return Ok(Polled::Cancelled);
            }

            let response = self
                .request(reqwest::Method::GET, status_url.clone())
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(ProviderError::Api {
                    status: response.status().as_u16(),
                    message: response.text().await.unwrap_or_default(),
                });
            }
            let status: StatusResponse = response.json().await?;

            match status.status.as_str() {
                "completed" | "succeeded" => {
                    let url = status.url.ok_or(ProviderError::TaskFailed {
                        task_id: id.to_string(),
                        message: "terminal state without an output url".to_string(),
                    })?;
                    return Ok(Polled::Completed(TaskOutput { url }));
                }
                "failed" => {
                    return Err(ProviderError::TaskFailed {
                        task_id: id.to_string(),
                        message: status.error.unwrap_or_else(|| "unknown error".to_string()),
                    });
                }
                _ => {}
            }

            if started.elapsed() >= opts.max_wait {
                return Err(ProviderError::Timeout {
                    task_id: id.to_string(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }

            sleep(opts.interval).await;
        }
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationProvider {
    async fn chat_completion(
        &self,
        system: &str,
        user: &str,
        opts: &ChatOptions,
    ) -> Result<String, ProviderError> {
        let url = Self::endpoint(&self.config.llm_base_url, "/v1/chat/completions");
        let body = json!({
            "model": opts.model,
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });

        let response = self
            .request(reqwest::Method::POST, url)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ProviderError::Api {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let completion: ChatCompletionResponse = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or(ProviderError::EmptyResponse)
    }

    async fn generate_image(
        &self,
        prompt: &str,
        opts: &ImageOptions,
    ) -> Result<TaskHandle, ProviderError> {
        let url = Self::endpoint(&self.config.media_base_url, "/v1/images/generations");
        let submitted = self
            .submit(
                url,
                json!({
                    "prompt": prompt,
                    "aspect_ratio": opts.aspect_ratio,
                    "negative_prompt": opts.negative_prompt,
                }),
            )
            .await?;
        Ok(TaskHandle {
            task_id: submitted.task_id,
        })
    }

    async fn edit_image(
        &self,
        reference_urls: &[String],
        prompt: &str,
        opts: &ImageOptions,
    ) -> Result<TaskHandle, ProviderError> {
        let url = Self::endpoint(&self.config.media_base_url, "/v1/images/edits");
        let submitted = self
            .submit(
                url,
                json!({
                    "prompt": prompt,
                    "image_urls": reference_urls,
                    "aspect_ratio": opts.aspect_ratio,
                }),
            )
            .await?;
        Ok(TaskHandle {
            task_id: submitted.task_id,
        })
    }

    async fn generate_video(&self, request: &VideoRequest) -> Result<TaskHandle, ProviderError> {
        let url = Self::endpoint(&self.config.media_base_url, "/v1/videos/generations");
        let submitted = self
            .submit(
                url,
                json!({
                    "prompt": request.prompt,
                    "first_frame_url": request.first_frame_url,
                    "last_frame_url": request.last_frame_url,
                    "duration_seconds": request.duration_seconds,
                }),
            )
            .await?;
        Ok(TaskHandle {
            task_id: submitted.task_id,
        })
    }

    async fn poll_task(
        &self,
        task_id: &str,
        opts: &PollOptions,
    ) -> Result<Polled, ProviderError> {
        let url = Self::endpoint(&self.config.media_base_url, &format!("/v1/tasks/{task_id}"));
        self.poll_status(url, task_id, opts).await
    }

    async fn text_to_speech(&self, voice_id: &str, text: &str) -> Result<Vec<u8>, ProviderError> {
        let url = Self::endpoint(
            &self.config.tts_base_url,
            &format!("/v1/text-to-speech/{voice_id}"),
        );
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&json!({ "text": text }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ProviderError::Api {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn render_composite(
        &self,
        template_id: &str,
        modifications: &[RenderModification],
    ) -> Result<RenderHandle, ProviderError> {
        let url = Self::endpoint(&self.config.render_base_url, "/v1/renders");
        let mods: Vec<serde_json::Value> = modifications
            .iter()
            .map(|m| json!({ "name": m.name, "value": m.value }))
            .collect();
        let submitted = self
            .submit(
                url,
                json!({ "template_id": template_id, "modifications": mods }),
            )
            .await?;
        Ok(RenderHandle {
            render_id: submitted.task_id,
        })
    }

    async fn poll_render(
        &self,
        render_id: &str,
        opts: &PollOptions,
    ) -> Result<Polled, ProviderError> {
        let url = Self::endpoint(
            &self.config.render_base_url,
            &format!("/v1/renders/{render_id}"),
        );
        self.poll_status(url, render_id, opts).await
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(alias = "id")]
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}
