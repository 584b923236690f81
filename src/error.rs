//! Error types for the financial query pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Normalization error: {0}")]
    NormalizationError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Unsafe query rejected: {0}")]
    UnsafeQueryError(String),

    #[error("Query synthesis error: {0}")]
    SynthesisError(String),

    #[error("Upstream LLM error: {0}")]
    UpstreamError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::StorageError(e.to_string())
    }
}

impl PipelineError {
    /// Short machine-readable code used in API responses and logs
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::NormalizationError(_) => "NORMALIZATION_ERROR",
            PipelineError::StorageError(_) => "STORAGE_ERROR",
            PipelineError::UnsafeQueryError(_) => "UNSAFE_QUERY",
            PipelineError::SynthesisError(_) => "SYNTHESIS_ERROR",
            PipelineError::UpstreamError(_) => "UPSTREAM_ERROR",
            PipelineError::InvalidRequest(_) => "INVALID_REQUEST",
            PipelineError::ConfigError(_) => "CONFIG_ERROR",
            PipelineError::SerializationError(_) => "SERIALIZATION_ERROR",
            PipelineError::IoError(_) => "IO_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlx_errors_become_storage_errors() {
        let err: PipelineError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, PipelineError::StorageError(_)));
        assert_eq!(err.code(), "STORAGE_ERROR");
    }

    #[test]
    fn test_display_includes_category() {
        let err = PipelineError::UnsafeQueryError("multiple statements".to_string());
        assert_eq!(err.to_string(), "Unsafe query rejected: multiple statements");
    }
}
