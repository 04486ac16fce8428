use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Response};
use serde::Serialize;

use crate::core::{app_state::AppState, diagnostics::WebhookRecord, http::response_envelope::ApiResponse};

/// GET /api/v1/webhooks/recent
///
/// Recent webhook deliveries, newest first.
pub async fn recent_webhooks_route(State(state): State<Arc<AppState>>) -> Response {
    let records: Vec<WebhookRecord> = state.diagnostics.recent();
    ApiResponse::success(records).into_response_with_status(StatusCode::OK)
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub adapters: usize,
}

/// GET /health
pub async fn health_route(State(state): State<Arc<AppState>>) -> Response {
    ApiResponse::success(HealthResponse {
        status: "ok",
        adapters: state.registry.len(),
    })
    .into_response_with_status(StatusCode::OK)
}
