// Request / result envelopes.
//
// `InferenceRequest` / `InferenceResult` are what the job queue hands us and
// expects back. `GenerationRequest` is the typed view of the request's JSON
// input that the pipeline actually runs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ClipgenError;

// ── Generation Request ───────────────────────────────────────────────────────

fn default_num_frames() -> usize { 25 }
fn default_height() -> usize { 480 }
fn default_width() -> usize { 848 }
fn default_steps() -> usize { 64 }
fn default_guidance() -> f32 { 6.0 }
fn default_seed() -> u64 { 42 }

/// Parameters for one text-to-video generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_num_frames")]
    pub num_frames: usize,
    #[serde(default = "default_height")]
    pub height: usize,
    #[serde(default = "default_width")]
    pub width: usize,
    #[serde(default = "default_steps")]
    pub num_inference_steps: usize,
    #[serde(default = "default_guidance")]
    pub guidance_scale: f32,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            num_frames: default_num_frames(),
            height: default_height(),
            width: default_width(),
            num_inference_steps: default_steps(),
            guidance_scale: default_guidance(),
            seed: default_seed(),
        }
    }

    /// Parse the free-form JSON input of a queued job, filling defaults.
    pub fn from_input(input: &serde_json::Value) -> Result<Self, ClipgenError> {
        let req: Self = serde_json::from_value(input.clone())
            .map_err(|e| ClipgenError::InvalidRequest(e.to_string()))?;
        req.normalized()
    }

    /// Validate and round `num_frames` up so that `(num_frames - 1) % 6 == 0`,
    /// the frame-count granularity of the model's temporal compression.
    pub fn normalized(mut self) -> Result<Self, ClipgenError> {
        if self.prompt.trim().is_empty() {
            return Err(ClipgenError::InvalidRequest("prompt is required".into()));
        }
        if self.height == 0 || self.width == 0 || self.num_inference_steps == 0 {
            return Err(ClipgenError::InvalidRequest(format!(
                "height, width and num_inference_steps must be positive \
                 (got {}x{}, {} steps)",
                self.height, self.width, self.num_inference_steps
            )));
        }
        self.num_frames = valid_frame_count(self.num_frames);
        Ok(self)
    }
}

/// Smallest `n' >= n` with `(n' - 1) % 6 == 0`.
pub fn valid_frame_count(n: usize) -> usize {
    match n {
        0 => 1,
        n if (n - 1) % 6 == 0 => n,
        n => ((n - 1) / 6 + 1) * 6 + 1,
    }
}

// ── Queue Envelope ───────────────────────────────────────────────────────────

/// A job pulled from the work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    #[serde(default = "new_job_id")]
    pub job_id: String,
    #[serde(default)]
    pub user_id: String,
    /// Raw JSON input as stored in the job table.
    pub input_data: serde_json::Value,
    /// Destination bucket for the rendered output.
    #[serde(default)]
    pub output_bucket: String,
}

fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Outcome of a processed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResult {
    pub job_id: String,
    pub output_path: PathBuf,
    /// Wall-clock processing time in seconds.
    pub processing_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
