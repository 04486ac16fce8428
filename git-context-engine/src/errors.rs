//! Errors of the provider layer, webhook conversion and diff parsing.

use thiserror::Error;

use crate::git_providers::ProviderKind;

pub type GitContextEngineResult<T> = Result<T, GitContextEngineError>;

#[derive(Debug, Error)]
pub enum GitContextEngineError {
    #[error(transparent)]
    Provider(#[from] GitContextEngineProviderError),

    #[error(transparent)]
    Webhook(#[from] GitContextEngineWebhookError),

    #[error(transparent)]
    DiffParse(#[from] GitContextEngineDiffParseError),

    #[error(transparent)]
    Config(#[from] GitContextEngineConfigError),

    /// Input we refuse to act on: unparsable MR URL, missing discussion id...
    #[error("validation error: {0}")]
    Validation(String),
}

/// Failure talking to a hosting provider's REST API.
#[derive(Debug, Error)]
pub enum GitContextEngineProviderError {
    #[error("provider rejected the token (401)")]
    Unauthorized,

    #[error("token lacks permission (403)")]
    Forbidden,

    #[error("resource not found (404)")]
    NotFound,

    #[error("provider rate limit hit (429)")]
    RateLimited,

    /// 5xx from the provider or its gateway.
    #[error("provider failed with status {0}")]
    Server(u16),

    #[error("unexpected status {0}")]
    HttpStatus(u16),

    #[error("provider request timed out")]
    Timeout,

    /// DNS, connect or reset; no status was received.
    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected response body: {0}")]
    InvalidResponse(String),

    #[error("{0} is not supported by this provider")]
    Unsupported(&'static str),
}

impl GitContextEngineProviderError {
    /// Maps a non-2xx status to its variant.
    pub fn from_status(code: u16) -> Self {
        match code {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            429 => Self::RateLimited,
            500..=599 => Self::Server(code),
            _ => Self::HttpStatus(code),
        }
    }
}

impl From<reqwest::Error> for GitContextEngineProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(status) = e.status() {
            Self::from_status(status.as_u16())
        } else if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<reqwest::Error> for GitContextEngineError {
    fn from(e: reqwest::Error) -> Self {
        Self::Provider(e.into())
    }
}

/// A webhook delivery that did not become a [`crate::webhooks::UnifiedEvent`].
#[derive(Debug, Error)]
pub enum GitContextEngineWebhookError {
    #[error("malformed {provider} webhook payload: {reason}")]
    MalformedPayload { provider: &'static str, reason: String },

    #[error("{provider} event `{event_type}` is not handled")]
    UnsupportedEvent { provider: &'static str, event_type: String },

    /// Well-formed, but deliberately dropped (edited comment, closed MR, ...).
    #[error("{provider} event ignored: {reason}")]
    Ignored { provider: &'static str, reason: String },
}

impl GitContextEngineWebhookError {
    pub(crate) fn malformed(provider: &'static str, reason: impl ToString) -> Self {
        Self::MalformedPayload {
            provider,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GitContextEngineDiffParseError {
    #[error("bad hunk header `{0}`")]
    InvalidHunkHeader(String),
}

#[derive(Debug, Error)]
pub enum GitContextEngineConfigError {
    /// Nothing registered for this provider instance in the token store.
    #[error("no access token for {provider} at {instance_url}")]
    MissingToken { provider: ProviderKind, instance_url: String },

    #[error("invalid base api url: {0}")]
    InvalidBaseUrl(String),

    #[error("unsupported provider type: {0}")]
    UnsupportedProvider(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_variants() {
        assert!(matches!(GitContextEngineProviderError::from_status(401), GitContextEngineProviderError::Unauthorized));
        assert!(matches!(GitContextEngineProviderError::from_status(429), GitContextEngineProviderError::RateLimited));
        assert!(matches!(GitContextEngineProviderError::from_status(503), GitContextEngineProviderError::Server(503)));
        assert!(matches!(GitContextEngineProviderError::from_status(409), GitContextEngineProviderError::HttpStatus(409)));
    }
}
