//! LLM client interface with bounded concurrency and timeouts.
//!
//! Every classification and extraction prompt in the crate goes through
//! [`LlmClient::complete`]. Calls are limited by a process-wide semaphore
//! and a per-call timeout; callers decide whether a failure fails open
//! (safety gate) or closed (need extraction).

pub mod openai;

use async_trait::async_trait;
use serde_json::Value;

/// Errors from LLM calls.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The HTTP request failed.
    #[error("llm request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The API returned a non-success status.
    #[error("llm api error: status {0}")]
    Api(u16),

    /// The call exceeded the configured timeout.
    #[error("llm call timed out")]
    Timeout,

    /// The response carried no usable content.
    #[error("llm returned empty response")]
    Empty,
}

/// A single chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// System prompt.
    pub system: String,
    /// User message.
    pub user: String,
    /// Completion token budget.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Ask the API for a JSON object response.
    pub json_response: bool,
}

impl ChatRequest {
    /// Build a request with the defaults used by classification prompts.
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            max_tokens: 150,
            temperature: 0.3,
            json_response: false,
        }
    }

    /// Set the completion token budget.
    #[must_use]
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature.
    #[must_use]
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Request a JSON object response.
    #[must_use]
    pub fn json(mut self) -> Self {
        self.json_response = true;
        self
    }
}

/// Chat completion client.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run a completion and return the assistant text, trimmed.
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError>;
}

/// Extract a JSON object from model output.
///
/// Models occasionally wrap JSON in markdown fences or surrounding prose;
/// this strips fences first and otherwise falls back to the outermost
/// `{...}` span. Returns `None` when nothing parses.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    let trimmed = strip_code_fences(raw.trim());

    if let Ok(value) = serde_json::from_str::<Value>(&trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(trimmed.get(start..=end)?)
        .ok()
        .filter(Value::is_object)
}

fn strip_code_fences(text: &str) -> String {
    let mut out = text.trim();
    if out.starts_with("```") {
        out = out.trim_start_matches("```");
        out = out.strip_prefix("json").or_else(|| out.strip_prefix("JSON")).unwrap_or(out);
    }
    if out.ends_with("```") {
        out = out.trim_end_matches("```");
    }
    out.trim().to_owned()
}
