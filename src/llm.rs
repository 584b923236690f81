//! Language model seam
//!
//! The synthesizer and composer only see [`LanguageModel`]; the concrete
//! client (Gemini in production, [`ScriptedModel`] in tests) is chosen
//! once at startup.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::error::PipelineError;
use crate::Result;

/// One text completion request
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            temperature: 0.0,
            max_output_tokens: 1024,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }
}

/// Text-in, text-out model client
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Single completion; implementations own timeout and retry
    async fn generate(&self, request: &CompletionRequest) -> Result<String>;
}

/// Replays canned responses in order and records every prompt it sees.
/// An `Err` entry is surfaced as an upstream failure.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<std::result::Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = std::result::Result<String, String>>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Convenience for the common all-success script
    pub fn replying<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(replies.into_iter().map(|r| Ok(r.into())))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &CompletionRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().await.push(request.prompt.clone());

        match self.responses.lock().await.pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(PipelineError::UpstreamError(message)),
            None => Err(PipelineError::UpstreamError(
                "Scripted model has no responses left".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_model_replays_in_order() {
        let model = ScriptedModel::new(vec![Ok("first".to_string()), Err("boom".to_string())]);
        let request = CompletionRequest::new("system", "hello");

        assert_eq!(model.generate(&request).await.unwrap(), "first");
        assert!(matches!(
            model.generate(&request).await,
            Err(PipelineError::UpstreamError(m)) if m == "boom"
        ));
        assert!(model.generate(&request).await.is_err());

        assert_eq!(model.call_count(), 3);
        assert_eq!(model.prompts().await, vec!["hello"; 3]);
    }

    #[test]
    fn test_request_builder() {
        let request = CompletionRequest::new("sys", "prompt")
            .with_temperature(0.2)
            .with_max_output_tokens(256);
        assert_eq!(request.temperature, 0.2);
        assert_eq!(request.max_output_tokens, 256);
    }
}
