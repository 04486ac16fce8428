//! Errors of the LLM layer and the env/validation helpers that produce them.
//!
//! [`AiLlmError`] is what every public function returns. Setup problems are
//! [`ConfigError`], per-backend failures are [`ProviderError`]. Messages are
//! prefixed with `[llm]` so they are easy to attribute in mixed logs.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::config::llm_provider::LlmProvider;

pub type Result<T> = std::result::Result<T, AiLlmError>;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum AiLlmError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("[llm] request failed: {0}")]
    HttpTransport(#[from] reqwest::Error),

    /// The generation call did not finish within the configured limit.
    #[error("[llm] no answer within {0:?}")]
    Timeout(Duration),
}

/// Invalid or incomplete backend configuration, detected before any request.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("[llm] environment variable {0} is required")]
    MissingVar(&'static str),

    #[error("[llm] {var} is not a valid number ({reason})")]
    InvalidNumber { var: &'static str, reason: &'static str },

    /// `LLM_KIND` (or an `ai_type`) names a backend we do not ship.
    #[error("[llm] unknown backend `{0}`")]
    UnsupportedProvider(String),

    #[error("[llm] {var} is malformed: {reason}")]
    InvalidFormat { var: &'static str, reason: &'static str },

    #[error("[llm] {field} out of range ({detail})")]
    OutOfRange { field: &'static str, detail: &'static str },

    #[error("[llm] empty model name")]
    EmptyModel,
}

#[derive(Debug, Error)]
#[error("[llm] {provider}: {kind}")]
pub struct ProviderError {
    pub provider: LlmProvider,
    pub kind: ProviderErrorKind,
}

impl ProviderError {
    pub fn new(provider: LlmProvider, kind: ProviderErrorKind) -> Self {
        Self { provider, kind }
    }
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ProviderErrorKind {
    /// Config handed to a backend that serves another provider.
    #[error("config targets another backend")]
    InvalidProvider,

    #[error("API key not set")]
    MissingApiKey,

    #[error("endpoint `{0}` is not an http(s) URL")]
    InvalidEndpoint(String),

    #[error("{0}")]
    HttpStatus(HttpError),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("no completion in response")]
    EmptyChoices,
}

/// A non-2xx answer from the backend.
#[derive(Debug, Error)]
#[error("{url} answered {status}: {snippet}")]
pub struct HttpError {
    pub status: StatusCode,
    pub url: String,
    pub snippet: String,
}

const SNIPPET_CHARS: usize = 240;

/// First [`SNIPPET_CHARS`] characters of `text` on one line.
pub fn make_snippet(text: &str) -> String {
    text.chars()
        .take(SNIPPET_CHARS)
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Required variable; absent and blank are both [`ConfigError::MissingVar`].
pub fn must_env(name: &'static str) -> Result<String> {
    non_empty_env(name).ok_or_else(|| ConfigError::MissingVar(name).into())
}

/// Optional `u32`; unset or blank is `Ok(None)`, garbage is an error.
pub fn env_opt_u32(name: &'static str) -> Result<Option<u32>> {
    let Some(raw) = non_empty_env(name) else {
        return Ok(None);
    };
    raw.trim().parse::<u32>().map(Some).map_err(|_| {
        ConfigError::InvalidNumber {
            var: name,
            reason: "expected u32",
        }
        .into()
    })
}

pub fn validate_http_endpoint(var: &'static str, value: &str) -> Result<()> {
    if ["http://", "https://"].iter().any(|s| value.starts_with(s)) {
        return Ok(());
    }
    Err(ConfigError::InvalidFormat {
        var,
        reason: "must start with http:// or https://",
    }
    .into())
}

/// Inclusive range check that also rejects NaN and infinities.
pub fn validate_range_f32(field: &'static str, value: f32, min: f32, max: f32) -> Result<()> {
    if value.is_finite() && (min..=max).contains(&value) {
        return Ok(());
    }
    Err(ConfigError::OutOfRange {
        field,
        detail: "expected value in inclusive range",
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_requires_scheme() {
        assert!(validate_http_endpoint("X", "https://api.openai.com").is_ok());
        assert!(matches!(
            validate_http_endpoint("X", "api.openai.com"),
            Err(AiLlmError::Config(ConfigError::InvalidFormat { var: "X", .. }))
        ));
    }

    #[test]
    fn range_rejects_nan_and_bounds() {
        assert!(validate_range_f32("t", 0.0, 0.0, 1.0).is_ok());
        assert!(validate_range_f32("t", 1.01, 0.0, 1.0).is_err());
        assert!(validate_range_f32("t", f32::NAN, 0.0, 1.0).is_err());
    }

    #[test]
    fn snippet_is_single_line_and_bounded() {
        let body = format!("line1\nline2{}", "x".repeat(500));
        let s = make_snippet(&body);
        assert!(!s.contains('\n'));
        assert_eq!(s.chars().count(), SNIPPET_CHARS);
    }

    #[test]
    fn unset_optional_number_is_none() {
        assert!(matches!(env_opt_u32("MR_BOT_TEST_SURELY_UNSET_VAR"), Ok(None)));
        assert!(matches!(
            must_env("MR_BOT_TEST_SURELY_UNSET_VAR"),
            Err(AiLlmError::Config(ConfigError::MissingVar(_)))
        ));
    }
}
