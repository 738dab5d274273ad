//! Code-generation collaborator
//!
//! The orchestrator only sees [`CodeGenerator`]; [`HttpGenerator`] talks to an
//! Ollama or OpenAI-compatible model server.

use crate::config::{ModelConfig, Provider};
use crate::error::GenerationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

/// Longest error body kept in a [`GenerationError::Rejected`]
const MAX_ERROR_CONTENT_LEN: usize = 200;

/// Turns a prompt into raw model text
#[async_trait]
pub trait CodeGenerator: Send + Sync + Debug {
    /// Generate a completion for `prompt`
    ///
    /// # Errors
    /// Returns a [`GenerationError`] when the model cannot produce text.
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Generator backed by a model server over HTTP
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    client: reqwest::Client,
    config: ModelConfig,
}

impl HttpGenerator {
    /// Create a generator whose requests time out after `timeout`
    ///
    /// # Errors
    /// Returns `GenerationError::Unavailable` if the HTTP client cannot be built.
    pub fn new(config: ModelConfig, timeout: Duration) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Unavailable(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Model settings
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match self.config.provider {
            Provider::Ollama => format!("{base}/api/generate"),
            Provider::OpenAi => format!("{base}/v1/chat/completions"),
        }
    }

    async fn post<T: Serialize + Sync>(&self, body: &T) -> Result<String, GenerationError> {
        let mut request = self.client.post(self.endpoint()).json(body);
        if let Some(key) = self.config.api_key.as_deref() {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(map_send_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_send_error)?;
        if !status.is_success() {
            return Err(GenerationError::Rejected {
                status: status.as_u16(),
                body: truncate_str(text.trim(), MAX_ERROR_CONTENT_LEN).to_string(),
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl CodeGenerator for HttpGenerator {
    #[tracing::instrument(skip_all, fields(provider = ?self.config.provider, model = %self.config.model, prompt_len = prompt.len()))]
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let text = match self.config.provider {
            Provider::Ollama => {
                let body = OllamaRequest {
                    model: &self.config.model,
                    prompt,
                    stream: false,
                    options: OllamaOptions {
                        temperature: self.config.temperature,
                        num_predict: self.config.max_tokens,
                    },
                };
                let raw = self.post(&body).await?;
                serde_json::from_str::<OllamaResponse>(&raw)
                    .map_err(|e| GenerationError::Malformed(e.to_string()))?
                    .response
            }
            Provider::OpenAi => {
                let body = ChatRequest {
                    model: &self.config.model,
                    messages: vec![ChatMessage {
                        role: "user",
                        content: prompt,
                    }],
                    temperature: self.config.temperature,
                    max_tokens: self.config.max_tokens,
                };
                let raw = self.post(&body).await?;
                serde_json::from_str::<ChatResponse>(&raw)
                    .map_err(|e| GenerationError::Malformed(e.to_string()))?
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .ok_or_else(|| GenerationError::Malformed("no choices in response".into()))?
            }
        };
        tracing::debug!(response_len = text.len(), "generation finished");
        Ok(text)
    }
}

fn map_send_error(err: reqwest::Error) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Unavailable("model request timed out".into())
    } else if err.is_connect() {
        GenerationError::Unavailable(format!("could not connect to model server: {err}"))
    } else {
        GenerationError::Unavailable(err.to_string())
    }
}

/// Truncate to at most `max_chars` characters (Unicode-safe)
fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
