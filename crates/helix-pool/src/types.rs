//! Request, response and identifier types shared across the scheduler

use crate::{PoolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Logical device identifier, e.g. `gpu_0`
pub type DeviceId = String;

/// Model identifier, e.g. `llama-3-8b`
pub type ModelId = String;

/// Unique job identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Inference request submitted to the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub model_id: ModelId,
    pub input: String,
    /// Carried into job logs; dispatch order stays FIFO
    #[serde(default)]
    pub priority: Priority,
    /// Overrides the configured job timeout
    #[serde(default)]
    pub deadline: Option<Duration>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl InferenceRequest {
    pub fn new(model_id: impl Into<ModelId>, input: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            input: input.into(),
            priority: Priority::Normal,
            deadline: None,
            max_tokens: None,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Rejects requests that could never run
    ///
    /// `max_input_len` bounds the input in bytes.
    pub fn validate(&self, max_input_len: usize) -> Result<()> {
        if self.model_id.trim().is_empty() {
            return Err(PoolError::InvalidRequest("model is required".into()));
        }
        if self.input.is_empty() {
            return Err(PoolError::InvalidRequest("input is required".into()));
        }
        if self.input.len() > max_input_len {
            return Err(PoolError::InvalidRequest(format!(
                "input is {} bytes, limit is {max_input_len}",
                self.input.len()
            )));
        }
        Ok(())
    }
}

/// Why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
}

/// Completed inference result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub job_id: JobId,
    pub model_id: ModelId,
    pub device_id: DeviceId,
    pub output: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub finish_reason: FinishReason,
    pub latency: Duration,
    /// The model was already resident when the job was dispatched
    pub cache_hit: bool,
    pub created_at: DateTime<Utc>,
}

/// Rough token count at four characters per token, never zero
#[must_use]
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.len() / 4).unwrap_or(u32::MAX).max(1)
}
