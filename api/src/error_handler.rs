use ai_llm_service::AiLlmError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::warn;

use crate::core::http::response_envelope::ApiResponse;

/// Errors of the HTTP service: startup failures and trigger request rejections.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("environment variable {0} is required")]
    MissingEnv(&'static str),

    #[error(transparent)]
    Llm(#[from] AiLlmError),

    #[error(transparent)]
    Review(#[from] mr_reviewer::Error),

    #[error(transparent)]
    Provider(#[from] git_context_engine::GitContextEngineError),

    #[error("cannot bind listener")]
    Bind(#[source] std::io::Error),

    #[error("server stopped with an error")]
    Server(#[source] std::io::Error),

    /// `TRIGGER_SECRET` is empty, so manual triggers cannot be authorized.
    #[error("Trigger secret is not configured.")]
    TriggerSecretUnset,

    #[error("Invalid trigger secret.")]
    Unauthorized,

    #[error("{0}")]
    UnsupportedProvider(String),

    /// No token is registered for the instance behind the requested URL.
    #[error("{0}")]
    MissingCredentials(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::UnsupportedProvider(_) => StatusCode::BAD_REQUEST,
            AppError::MissingCredentials(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            AppError::MissingEnv(_) | AppError::TriggerSecretUnset => "SERVER_CONFIG_ERROR",
            AppError::Llm(_) => "LLM_ERROR",
            AppError::Review(_) => "REVIEW_ERROR",
            AppError::Provider(_) => "PROVIDER_ERROR",
            AppError::Bind(_) | AppError::Server(_) => "SERVER_ERROR",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::UnsupportedProvider(_) => "BAD_REQUEST",
            AppError::MissingCredentials(_) => "MISSING_CREDENTIALS",
        }
    }

    /// Request field at fault and what the caller should change, if any.
    fn field_hint(&self) -> Option<(&'static str, &'static str)> {
        match self {
            AppError::TriggerSecretUnset => Some(("secret", "Set TRIGGER_SECRET on the server.")),
            AppError::Unauthorized => Some(("secret", "Secret does not match the configured trigger secret.")),
            AppError::UnsupportedProvider(_) => Some(("provider_type", "Use gitlab, github or bitbucket.")),
            AppError::MissingCredentials(_) => {
                Some(("url", "No access token is configured for this provider instance."))
            }
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        let envelope = match self.field_hint() {
            Some((path, hint)) => ApiResponse::<()>::field_error(self.error_code(), self.to_string(), path, hint),
            None => ApiResponse::<()>::error(self.error_code(), self.to_string(), Vec::new()),
        };
        envelope.into_response_with_status(status)
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_rejections_map_to_statuses() {
        assert_eq!(AppError::TriggerSecretUnset.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(AppError::Unauthorized.into_response().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::UnsupportedProvider("gitea".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::MissingCredentials("no token".into()).into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(AppError::Unauthorized.field_hint().map(|h| h.0), Some("secret"));
        assert!(AppError::MissingEnv("API_ADDRESS").field_hint().is_none());
    }
}
