//! Error taxonomy for the analysis pipeline.
//!
//! Local-parse problems are not errors at all (they become
//! [`ParserHint`](crate::models::ParserHint)s). Model transport failures
//! ([`InvokeError`]) and model output failures ([`RecoveryError`]) degrade
//! to precheck-only results. Only [`AnalysisError`] ever reaches a caller.

use thiserror::Error;

/// Failure of a single call to the model provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvokeError {
    #[error("model request timed out after {0}s")]
    Timeout(u64),

    #[error("network error: {0}")]
    Network(String),

    #[error("model provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("could not decode provider response: {0}")]
    Decode(String),

    #[error("API key environment variable {0} is not set")]
    MissingApiKey(String),
}

impl InvokeError {
    /// Timeouts, network failures, HTTP 429 and HTTP 5xx are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            InvokeError::Timeout(_) | InvokeError::Network(_) => true,
            InvokeError::Http { status, .. } => *status == 429 || (500..600).contains(status),
            InvokeError::Decode(_) | InvokeError::MissingApiKey(_) => false,
        }
    }
}

/// The model answered, but its output could not be used.
///
/// Neither variant is retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecoveryError {
    #[error("no valid JSON could be extracted from the model output")]
    LlmParse { raw: String },

    #[error("model output failed schema validation: {}", violations.join("; "))]
    SchemaValidation {
        parsed: serde_json::Value,
        violations: Vec<String>,
    },
}

impl RecoveryError {
    pub fn code(&self) -> &'static str {
        match self {
            RecoveryError::LlmParse { .. } => "llm_parse_error",
            RecoveryError::SchemaValidation { .. } => "schema_validation_error",
        }
    }
}

/// Errors surfaced to the caller of [`Analyzer::analyze`](crate::pipeline::Analyzer::analyze).
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}
