use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use chrono::Utc;
use git_context_engine::{credentials::extract_instance_url, git_providers::ProviderKind};
use mr_reviewer::{AiSettings, ProviderSettings, ReviewRequest};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::{
    core::{app_state::AppState, http::response_envelope::ApiResponse},
    error_handler::{AppError, AppResult},
};

/// Request body of a manual review trigger.
#[derive(Debug, Deserialize)]
pub struct TriggerReviewRequest {
    /// Canonical MR/PR web URL.
    pub url: String,
    /// `gitlab`, `github` or `bitbucket` (prefix match).
    pub provider_type: String,
    /// Shared secret used to protect the endpoint from unauthorized calls.
    pub secret: String,
    /// Overrides the server's default AI backend.
    #[serde(default)]
    pub ai: Option<AiSettings>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct TriggerReviewResponse {
    pub review_id: String,
    pub message: String,
}

/// POST /api/v1/reviews
///
/// Validates the shared secret, resolves the provider token for the URL's
/// instance and starts the review in the background. Returns the review id
/// right away; the outcome is only logged.
#[instrument(name = "trigger_review_route", skip_all)]
pub async fn trigger_review_route(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TriggerReviewRequest>,
) -> AppResult<Response> {
    if let Some(id) = headers.get("X-Request-Id").and_then(|h| h.to_str().ok()) {
        debug!(%id, "request id attached");
    }

    check_secret(&state.trigger_secret, &body.secret)?;

    let kind = ProviderKind::from_type_str(&body.provider_type)
        .map_err(|e| AppError::UnsupportedProvider(e.to_string()))?;

    let instance = extract_instance_url(&body.url);
    let token = state
        .tokens
        .lookup_token(kind, &instance)
        .await
        .map_err(|e| AppError::MissingCredentials(e.to_string()))?;

    let review_id = format!(
        "manual-{}",
        Utc::now().timestamp_nanos_opt().unwrap_or_else(|| Utc::now().timestamp_micros() * 1000)
    );
    let request = ReviewRequest {
        review_id: review_id.clone(),
        url: body.url.trim().to_string(),
        provider: ProviderSettings {
            provider_type: kind.as_str().to_string(),
            base_url: instance,
            token,
        },
        ai: body.ai.unwrap_or_else(|| state.default_ai.clone()),
        timeout: body.timeout_secs.map(std::time::Duration::from_secs),
    };

    info!(review_id = %review_id, provider = kind.as_str(), url = %request.url, "manual review queued");
    let rx = state.reviews.clone().process_review_async(request);
    tokio::spawn(async move {
        match rx.await {
            Ok(result) if result.success => info!(
                review_id = %result.review_id,
                comments = result.comments_count,
                duration_ms = result.duration_ms as u64,
                "manual review finished"
            ),
            Ok(result) => error!(
                review_id = %result.review_id,
                error = result.error.as_deref().unwrap_or_default(),
                "manual review failed"
            ),
            Err(_) => error!("manual review task dropped its result"),
        }
    });

    Ok(ApiResponse::success(TriggerReviewResponse {
        review_id,
        message: "Review started.".into(),
    })
    .into_response_with_status(StatusCode::ACCEPTED))
}

fn check_secret(expected: &str, provided: &str) -> AppResult<()> {
    let expected = expected.trim();
    if expected.is_empty() {
        return Err(AppError::TriggerSecretUnset);
    }
    let provided = provided.trim();
    if provided.is_empty() || !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        return Err(AppError::Unauthorized);
    }
    Ok(())
}

/// Byte comparison whose running time depends only on the lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use axum::response::IntoResponse;
    use git_context_engine::webhooks::WebhookRegistry;

    use super::*;

    fn body(secret: &str, provider: &str) -> Json<TriggerReviewRequest> {
        Json(TriggerReviewRequest {
            url: "https://gitlab.example.com/group/project/-/merge_requests/42".into(),
            provider_type: provider.into(),
            secret: secret.into(),
            ai: None,
            timeout_secs: None,
        })
    }

    #[test]
    fn secret_check_statuses() {
        assert!(matches!(check_secret("", "x"), Err(AppError::TriggerSecretUnset)));
        assert!(matches!(check_secret("a", "b"), Err(AppError::Unauthorized)));
        assert!(matches!(check_secret("a", " "), Err(AppError::Unauthorized)));
        assert!(check_secret(" a ", "a").is_ok());
    }

    #[test]
    fn secret_comparison_checks_every_byte() {
        assert!(constant_time_eq(b"s3cret", b"s3cret"));
        assert!(!constant_time_eq(b"s3cret", b"s3creT"));
        assert!(!constant_time_eq(b"s3cret", b"s3cre"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(matches!(check_secret("s3cret", "s3cres"), Err(AppError::Unauthorized)));
        assert!(check_secret("s3cret", " s3cret\n").is_ok());
    }

    #[tokio::test]
    async fn rejects_bad_secret_and_missing_credentials() {
        let state = Arc::new(AppState::for_tests(WebhookRegistry::new(), "s3cret"));

        let resp = trigger_review_route(State(state.clone()), HeaderMap::new(), body("nope", "gitlab")).await.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = trigger_review_route(State(state.clone()), HeaderMap::new(), body("s3cret", "gitea")).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // the test state has no tokens at all
        let resp = trigger_review_route(State(state), HeaderMap::new(), body("s3cret", "gitlab")).await.into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
