//! Model execution seam
//!
//! The scheduler only needs two things from an execution engine: loading a
//! model onto a device and generating output. [`SimulatedRuntime`] stands in
//! for a real engine with fixed delays and canned replies.

use crate::types::{FinishReason, ModelId, estimate_tokens};
use crate::{PoolError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Output of one generation call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub output: String,
    pub tokens_used: u32,
    pub finish_reason: FinishReason,
}

#[async_trait]
pub trait ModelRuntime: Send + Sync {
    async fn load(&self, model: &str, device: &str) -> Result<()>;

    async fn generate(&self, model: &str, input: &str, max_tokens: Option<u32>) -> Result<Generation>;
}

/// In-process runtime with configurable latency
#[derive(Debug)]
pub struct SimulatedRuntime {
    load_delay: Duration,
    inference_delay: Duration,
    failing: RwLock<HashSet<ModelId>>,
    loads: AtomicU64,
    generations: AtomicU64,
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_millis(500))
    }
}

impl SimulatedRuntime {
    #[must_use]
    pub fn new(load_delay: Duration, inference_delay: Duration) -> Self {
        Self {
            load_delay,
            inference_delay,
            failing: RwLock::new(HashSet::new()),
            loads: AtomicU64::new(0),
            generations: AtomicU64::new(0),
        }
    }

    /// No artificial latency
    #[must_use]
    pub fn instant() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Makes every load and generation for `model` fail
    pub fn fail_model(&self, model: impl Into<ModelId>) {
        self.failing.write().insert(model.into());
    }

    pub fn recover_model(&self, model: &str) {
        self.failing.write().remove(model);
    }

    #[must_use]
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn generation_count(&self) -> u64 {
        self.generations.load(Ordering::Relaxed)
    }

    fn check(&self, model: &str, stage: &str) -> Result<()> {
        if self.failing.read().contains(model) {
            return Err(PoolError::Runtime {
                model: model.to_string(),
                message: format!("simulated {stage} failure"),
            });
        }
        Ok(())
    }
}

fn canned_reply(input: &str) -> &'static str {
    let text = input.to_lowercase();
    let has_word = |w: &str| text.split(|c: char| !c.is_alphanumeric()).any(|t| t == w);
    if text.trim().is_empty() {
        "I'm here to help! What would you like to know?"
    } else if has_word("hello") || has_word("hi") {
        "Hello! I'm the HelixFlow assistant. How can I help you today?"
    } else if text.contains("thank") {
        "You're welcome! Is there anything else I can help you with?"
    } else if text.contains("code") || text.contains("programming") {
        "I can help with programming questions! What specific coding challenge are you working on?"
    } else if text.contains("explain") {
        "I'd be happy to explain that. Could you provide more specific details about what you'd like me to clarify?"
    } else if text.contains("help") {
        "I'm here to help! I can answer questions, provide information, or help solve problems."
    } else if text.len() < 5 {
        "I see you've entered a short message. Could you provide more details so I can better assist you?"
    } else if text.len() > 100 {
        "Thank you for the detailed message. I've processed your request and I'm ready to assist based on what you've shared."
    } else {
        "I understand your message. I'm here to provide helpful and accurate responses to your queries."
    }
}

#[async_trait]
impl ModelRuntime for SimulatedRuntime {
    async fn load(&self, model: &str, device: &str) -> Result<()> {
        debug!(model, device, delay_ms = self.load_delay.as_millis() as u64, "Simulating model load");
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        self.check(model, "load")?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn generate(&self, model: &str, input: &str, max_tokens: Option<u32>) -> Result<Generation> {
        if !self.inference_delay.is_zero() {
            tokio::time::sleep(self.inference_delay).await;
        }
        self.check(model, "inference")?;
        self.generations.fetch_add(1, Ordering::Relaxed);

        let output = canned_reply(input);
        let tokens = estimate_tokens(output);
        let (tokens_used, finish_reason) = match max_tokens {
            Some(limit) if tokens > limit => (limit, FinishReason::Length),
            _ => (tokens, FinishReason::Stop),
        };
        Ok(Generation { output: output.to_string(), tokens_used, finish_reason })
    }
}
