//! Crate-wide error hierarchy for mr-reviewer.
//!
//! - Single root `Error` for all public functions.
//! - Provider failures come from `git-context-engine`, LLM failures from
//!   `ai-llm-service`; both convert with `?`.
//! - Batch failures keep the last underlying error and the attempt count.

use std::time::Duration;

use ai_llm_service::AiLlmError;
use git_context_engine::GitContextEngineError;
use thiserror::Error;

/// Convenient alias for crate-wide results.
pub type MrResult<T> = Result<T, Error>;

/// Root error type for the mr-reviewer crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Git provider failure (fetch, post, token lookup, webhook conversion).
    #[error(transparent)]
    Provider(#[from] GitContextEngineError),

    /// LLM backend failure.
    #[error(transparent)]
    Llm(#[from] AiLlmError),

    /// Configuration problems (unsupported provider/AI type, bad URLs).
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Model answered, but not in the expected `{summary, comments}` shape.
    #[error("invalid AI response: {0}")]
    InvalidAiResponse(String),

    /// A batch failed on every attempt.
    #[error("batch {batch} failed after {attempts} attempts: {source}")]
    BatchFailed {
        batch: usize,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// The whole review exceeded its deadline.
    #[error("review timed out after {0:?}")]
    Timeout(Duration),

    /// Input validation errors (missing merge request, empty body, ...).
    #[error("validation error: {0}")]
    Validation(String),
}

/// Configuration and setup errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported provider type: {0}")]
    UnsupportedProvider(String),

    #[error("unsupported AI type: {0}")]
    UnsupportedAi(String),

    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),

    #[error("missing value for {0}")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Provider(GitContextEngineError::from(e))
    }
}

impl Error {
    /// True for errors raised because the deadline expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Llm(AiLlmError::Timeout(_)))
    }
}
