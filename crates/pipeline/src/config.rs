use std::time::Duration;

use providers::PollOptions;
use serde::{Deserialize, Serialize};

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Bounds for one poll loop: the hard maximum wait and the interval
/// between status checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PollSettings {
    pub max_wait_secs: u64,
    pub interval_secs: u64,
}

impl PollSettings {
    pub fn options(&self) -> PollOptions {
        PollOptions::new(
            Duration::from_secs(self.max_wait_secs),
            Duration::from_secs(self.interval_secs),
        )
    }
}

/// Flat per-call USD rates used by the cost ledger. Billing reconciliation
/// happens outside the pipeline; these are the amounts recorded per
/// successful call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostRates {
    pub chat_call: f64,
    pub image_task: f64,
    pub video_task: f64,
    pub tts_call: f64,
    pub render_task: f64,
}

/// Runtime tuning for the orchestration core. Poll bounds and retry
/// counts are deliberately per-stage rather than shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub worker_count: usize,
    pub job_poll_interval_secs: u64,
    pub job_max_attempts: i64,
    pub job_retry_delay_seconds: i64,
    /// Immediate per-unit submission retries, local to one unit of work.
    pub unit_retry_attempts: usize,
    pub unit_retry_delay_secs: u64,
    pub image_poll: PollSettings,
    pub video_poll: PollSettings,
    pub render_poll: PollSettings,
    pub chat_model: String,
    pub chat_temperature: f32,
    /// Temperature for the single stricter re-ask after a parse failure.
    pub strict_temperature: f32,
    pub render_template_id: String,
    pub cost: CostRates,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: env_usize("BACKLOT_WORKER_COUNT", 4),
            job_poll_interval_secs: env_u64("BACKLOT_JOB_POLL_INTERVAL_SECS", 2),
            job_max_attempts: env_u64("BACKLOT_JOB_MAX_ATTEMPTS", 3) as i64,
            job_retry_delay_seconds: env_u64("BACKLOT_JOB_RETRY_DELAY_SECS", 30) as i64,
            unit_retry_attempts: env_usize("BACKLOT_UNIT_RETRY_ATTEMPTS", 2),
            unit_retry_delay_secs: env_u64("BACKLOT_UNIT_RETRY_DELAY_SECS", 2),
            image_poll: PollSettings {
                max_wait_secs: env_u64("BACKLOT_IMAGE_MAX_WAIT_SECS", 120),
                interval_secs: 2,
            },
            video_poll: PollSettings {
                max_wait_secs: env_u64("BACKLOT_VIDEO_MAX_WAIT_SECS", 600),
                interval_secs: 5,
            },
            render_poll: PollSettings {
                max_wait_secs: env_u64("BACKLOT_RENDER_MAX_WAIT_SECS", 600),
                interval_secs: 10,
            },
            chat_model: std::env::var("BACKLOT_CHAT_MODEL")
                .unwrap_or_else(|_| "gpt-4o".to_string()),
            chat_temperature: 0.8,
            strict_temperature: 0.2,
            render_template_id: std::env::var("BACKLOT_RENDER_TEMPLATE_ID")
                .unwrap_or_else(|_| "default-vertical".to_string()),
            cost: CostRates {
                chat_call: env_f64("BACKLOT_COST_CHAT", 0.01),
                image_task: env_f64("BACKLOT_COST_IMAGE", 0.04),
                video_task: env_f64("BACKLOT_COST_VIDEO", 0.40),
                tts_call: env_f64("BACKLOT_COST_TTS", 0.02),
                render_task: env_f64("BACKLOT_COST_RENDER", 0.10),
            },
        }
    }
}

impl PipelineConfig {
    pub fn unit_retry_delay(&self) -> Duration {
        Duration::from_secs(self.unit_retry_delay_secs)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_secs(self.job_poll_interval_secs)
    }
}
