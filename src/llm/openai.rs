//! OpenAI-compatible chat completions client.
//!
//! Works against the official API or any compatible endpoint via
//! `LLM_BASE_URL`. Concurrency is bounded by a semaphore sized from
//! `MAX_LLM_CONCURRENCY`; each call is wrapped in `LLM_TIMEOUT_SECONDS`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::debug;

use super::{ChatRequest, LlmClient, LlmError};

const COMPLETIONS_PATH: &str = "/v1/chat/completions";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Chat completions request body.
#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

/// A message in chat format.
#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

/// Chat completions response body.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// OpenAI-compatible [`LlmClient`] with bounded concurrency.
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    permits: Semaphore,
}

impl OpenAiClient {
    /// Create a client.
    ///
    /// `max_in_flight` bounds concurrent API calls process-wide; `timeout`
    /// caps each call end to end.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_in_flight: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
            model: model.into(),
            timeout,
            permits: Semaphore::new(max_in_flight.max(1)),
        }
    }

    async fn call(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let body = ApiRequest {
            model: self.model.clone(),
            messages: vec![
                ApiMessage {
                    role: "system",
                    content: request.system.clone(),
                },
                ApiMessage {
                    role: "user",
                    content: request.user.clone(),
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request
                .json_response
                .then(|| json!({"type": "json_object"})),
        };

        let url = format!("{}{COMPLETIONS_PATH}", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Api(status.as_u16()));
        }

        let parsed: ApiResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_owned())
            .filter(|text| !text.is_empty())
            .ok_or(LlmError::Empty)?;

        debug!(model = %self.model, chars = content.len(), "llm completion received");
        Ok(content)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError> {
        // Closed semaphores never occur here; treat an error as unavailable.
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LlmError::Timeout)?;

        match tokio::time::timeout(self.timeout, self.call(&request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let body = ApiRequest {
            model: "gpt-4o-mini".to_owned(),
            messages: vec![ApiMessage {
                role: "system",
                content: "eres un moderador".to_owned(),
            }],
            temperature: 0.3,
            max_tokens: 150,
            response_format: Some(json!({"type": "json_object"})),
        };
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(value["model"], "gpt-4o-mini");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_request_body_omits_response_format() {
        let body = ApiRequest {
            model: "gpt-4o-mini".to_owned(),
            messages: vec![],
            temperature: 0.0,
            max_tokens: 50,
            response_format: None,
        };
        let value = serde_json::to_value(&body).expect("serialize");
        assert!(value.get("response_format").is_none());
    }

    #[test]
    fn test_response_parsing_tolerates_missing_fields() {
        let parsed: ApiResponse = serde_json::from_str(r#"{"choices": []}"#).expect("parse");
        assert!(parsed.choices.is_empty());

        let parsed: ApiResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"content": "plomero"}}], "model": "x"}"#,
        )
        .expect("parse");
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("plomero")
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let client = OpenAiClient::new(
            "http://127.0.0.1:1",
            "key",
            "model",
            2,
            Duration::from_millis(300),
        );
        let result = client
            .complete(ChatRequest::new("system", "user"))
            .await;
        assert!(result.is_err());
    }
}
