//! Runtime configuration from environment variables
//!
//! Binaries call `dotenv::dotenv()` first, so a local `.env` file works too.

use std::str::FromStr;
use std::time::Duration;

use crate::composer::DEFAULT_PROMPT_ROW_LIMIT;
use crate::error::PipelineError;
use crate::gemini::{GeminiConfig, DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::memory::context::DEFAULT_WINDOW;
use crate::Result;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://financial_records.db";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_RESULT_ROWS: usize = 1_000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub gemini: GeminiConfig,
    pub conversation_window: usize,
    pub max_result_rows: usize,
    pub prompt_row_limit: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port = match get("PORT").or_else(|| get("API_PORT")) {
            Some(raw) => parse_value("PORT", &raw)?,
            None => DEFAULT_PORT,
        };

        let timeout_secs: u64 = parse_or(&get, "LLM_TIMEOUT_SECS", 30)?;
        let backoff_ms: u64 = parse_or(&get, "LLM_BACKOFF_MS", 500)?;

        let gemini = GeminiConfig {
            api_key: get("GEMINI_API_KEY"),
            model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: get("GEMINI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            timeout: Duration::from_secs(timeout_secs),
            max_retries: parse_or(&get, "LLM_MAX_RETRIES", 2)?,
            initial_backoff: Duration::from_millis(backoff_ms),
        };

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            port,
            gemini,
            conversation_window: parse_or(&get, "CONVERSATION_WINDOW", DEFAULT_WINDOW)?,
            max_result_rows: parse_or(&get, "MAX_RESULT_ROWS", DEFAULT_MAX_RESULT_ROWS)?,
            prompt_row_limit: parse_or(&get, "PROMPT_ROW_LIMIT", DEFAULT_PROMPT_ROW_LIMIT)?,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| PipelineError::ConfigError(format!("{} has invalid value {:?}: {}", key, raw, e)))
}
