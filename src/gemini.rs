//! Gemini API client
//!
//! Implements [`LanguageModel`] over the `generateContent` endpoint.
//! Uses a long-lived reqwest::Client for connection pooling; transient
//! failures (timeouts, connection errors, 429, 5xx) are retried with
//! exponential backoff.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::llm::{CompletionRequest, LanguageModel};
use crate::Result;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
}

/// Why a single attempt failed
enum AttemptError {
    Retryable(String),
    Fatal(String),
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                PipelineError::ConfigError(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }

    async fn attempt(&self, api_key: &str, body: &GeminiRequest) -> std::result::Result<String, AttemptError> {
        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", api_key)])
            .json(body)
            .send()
            .await
            .map_err(|e| {
                let e = e.without_url();
                if e.is_timeout() || e.is_connect() {
                    AttemptError::Retryable(format!("Gemini request failed: {}", e))
                } else {
                    AttemptError::Fatal(format!("Gemini request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = format!("Gemini API returned {}: {}", status, error_text);
            return if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                Err(AttemptError::Retryable(message))
            } else {
                Err(AttemptError::Fatal(message))
            };
        }

        // The client timeout also covers the body, which can stall after the headers
        let payload = response.bytes().await.map_err(|e| {
            let e = e.without_url();
            if e.is_timeout() {
                AttemptError::Retryable(format!("Gemini response body timed out: {}", e))
            } else {
                AttemptError::Fatal(format!("Gemini response body failed: {}", e))
            }
        })?;

        let gemini_response: GeminiResponse = serde_json::from_slice(&payload)
            .map_err(|e| AttemptError::Fatal(format!("Gemini parse error: {}", e)))?;

        let text: String = gemini_response
            .candidates
            .first()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .ok_or_else(|| AttemptError::Fatal("No candidates in Gemini response".to_string()))?;

        if let Some(usage) = &gemini_response.usage_metadata {
            debug!(
                prompt_tokens = usage.prompt_token_count,
                output_tokens = usage.candidates_token_count,
                "Gemini usage"
            );
        }

        Ok(text)
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, request: &CompletionRequest) -> Result<String> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                PipelineError::UpstreamError("GEMINI_API_KEY not configured".to_string())
            })?;

        let body = GeminiRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: request.prompt.clone(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_output_tokens,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: request.system.clone(),
                }],
            },
        };

        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0;

        loop {
            info!(model = %self.config.model, attempt, "Calling Gemini API");

            match self.attempt(api_key, &body).await {
                Ok(text) => return Ok(text),
                Err(AttemptError::Fatal(message)) => {
                    error!("{}", message);
                    return Err(PipelineError::UpstreamError(message));
                }
                Err(AttemptError::Retryable(message)) => {
                    if attempt >= self.config.max_retries {
                        error!(attempts = attempt + 1, "{}", message);
                        return Err(PipelineError::UpstreamError(message));
                    }
                    warn!(retry_in_ms = backoff.as_millis() as u64, "{}", message);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: i64,
    #[serde(default)]
    candidates_token_count: i64,
}
