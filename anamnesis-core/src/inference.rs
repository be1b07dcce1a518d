//! Inference service boundary.
//!
//! Provides an `InferenceService` trait with a client for
//! OpenAI-compatible chat-completions endpoints (Groq-style). The
//! extractor is the only consumer; it treats every error here as "no
//! extraction" and never surfaces them past its own boundary.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

/// Inference call errors. All of them are absorbed by the extractor.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Inference request timed out")]
    Timeout,

    #[error("Inference service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Invalid response from inference service: {0}")]
    InvalidResponse(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Missing API key")]
    MissingApiKey,

    #[error("All {attempts} retry attempts failed")]
    RetryExhausted { attempts: usize },
}

/// Abstraction over text-generation providers.
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Run one completion: a system instruction plus a user prompt,
    /// returning the raw model text.
    async fn generate(&self, system: &str, user: &str) -> Result<String, InferenceError>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

/// Client configuration for `ChatCompletionClient`.
#[derive(Debug, Clone)]
pub struct ChatCompletionConfig {
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ChatCompletionConfig {
    pub fn new(api_key: Option<String>, model: String) -> Self {
        let api_key = api_key
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("GROQ_API_KEY").ok())
            .unwrap_or_default();

        Self {
            api_key,
            model,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay_ms: 1000,
            max_tokens: 1000,
            temperature: 0.0,
        }
    }
}

// ============================================================================
// Chat-completions API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ============================================================================
// ChatCompletionClient
// ============================================================================

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct ChatCompletionClient {
    client: Client,
    config: ChatCompletionConfig,
    base_url: String,
}

impl ChatCompletionClient {
    pub fn new(config: ChatCompletionConfig) -> Result<Self, InferenceError> {
        Self::with_base_url(config, "https://api.groq.com/openai/v1".to_string())
    }

    /// Create a client with a custom base URL (for testing / self-hosted
    /// endpoints).
    pub fn with_base_url(
        config: ChatCompletionConfig,
        base_url: String,
    ) -> Result<Self, InferenceError> {
        if config.api_key.is_empty() {
            return Err(InferenceError::MissingApiKey);
        }

        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            config,
            base_url,
        })
    }

    async fn generate_once(&self, system: &str, user: &str) -> Result<String, InferenceError> {
        let url = format!("{}/chat/completions", self.base_url);

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout
                } else if e.is_connect() {
                    InferenceError::ServiceUnavailable(e.to_string())
                } else {
                    InferenceError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or(error_body);

            tracing::error!(code = status.as_u16(), message = %message, "Inference API error");

            return Err(InferenceError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::InvalidResponse(e.to_string()))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| InferenceError::InvalidResponse("empty completion".to_string()))
    }
}

#[async_trait]
impl InferenceService for ChatCompletionClient {
    async fn generate(&self, system: &str, user: &str) -> Result<String, InferenceError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let result = Retry::spawn(retry_strategy, || self.generate_once(system, user)).await;

        match result {
            Ok(text) => Ok(text),
            Err(e) => {
                tracing::warn!(
                    attempts = self.config.max_retries,
                    error = %e,
                    "All inference retry attempts failed"
                );
                Err(InferenceError::RetryExhausted {
                    attempts: self.config.max_retries,
                })
            }
        }
    }

    fn name(&self) -> &str {
        "chat-completions"
    }
}

// ============================================================================
// TESTS
// ============================================================================
