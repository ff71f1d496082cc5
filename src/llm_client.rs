// src/llm_client.rs

use crate::config::LlmSection;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// One prompt to the completion service.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// Ask the service for a single JSON object response.
    pub json_mode: bool,
}

/// Anything that turns a prompt into the assistant's reply text.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Failure of a single attempt, tagged with whether retrying can help.
struct AttemptError {
    message: String,
    transient: bool,
}

impl AttemptError {
    fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// OpenAI-compatible `/chat/completions` client with a per-attempt
/// timeout and bounded exponential backoff.
pub struct OpenAiClient {
    client: Client,
    url: String,
    model: String,
    api_key: String,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl OpenAiClient {
    pub fn new(llm: &LlmSection, api_key: &str) -> Self {
        Self {
            client: Client::new(),
            url: format!("{}/chat/completions", llm.base_url.trim_end_matches('/')),
            model: llm.model.clone(),
            api_key: api_key.to_string(),
            timeout: Duration::from_secs(llm.timeout_secs),
            max_retries: llm.max_retries,
            backoff: Duration::from_millis(llm.retry_backoff_ms),
        }
    }

    async fn attempt(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<String, AttemptError> {
        let body = ChatRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: 0.0,
            response_format: request.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AttemptError::transient(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("LLM API error {status}: {text}");
            return Err(if is_transient_status(status) {
                AttemptError::transient(message)
            } else {
                AttemptError::fatal(message)
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| AttemptError::fatal(format!("unreadable completion body: {e}")))?;

        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| AttemptError::fatal("empty response from LLM"))
    }
}

#[async_trait]
impl ChatCompletion for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(self.timeout, self.attempt(request)).await {
                Ok(result) => result,
                Err(_) => Err(AttemptError::transient(format!(
                    "no reply within {}s",
                    self.timeout.as_secs()
                ))),
            };

            match outcome {
                Ok(content) => {
                    debug!(attempt, chars = content.len(), "LLM reply received");
                    return Ok(content);
                }
                Err(e) if e.transient && attempt < self.max_retries => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt);
                    warn!(
                        attempt,
                        error = %e.message,
                        delay_ms = delay.as_millis() as u64,
                        "LLM call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(PipelineError::Collaborator(e.message)),
            }
        }
    }
}

/// Strip markdown fences a model may add despite instructions.
fn strip_fences(s: &str) -> &str {
    s.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

fn outermost(s: &str, open: char, close: char) -> Option<&str> {
    let start = s.find(open)?;
    let end = s.rfind(close)?;
    (end > start).then(|| &s[start..=end])
}

/// Extract the outermost JSON object from a reply that may carry
/// surrounding text.
pub fn extract_json_object(s: &str) -> Result<&str> {
    outermost(strip_fences(s), '{', '}')
        .ok_or_else(|| PipelineError::Collaborator(format!("no JSON object in LLM reply: {s}")))
}

/// Extract the outermost JSON array from a reply.
pub fn extract_json_array(s: &str) -> Result<&str> {
    outermost(strip_fences(s), '[', ']')
        .ok_or_else(|| PipelineError::Collaborator(format!("no JSON array in LLM reply: {s}")))
}
