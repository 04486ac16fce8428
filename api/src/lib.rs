pub mod core;
pub mod error_handler;
mod middleware_layer;
mod routes;

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tokio::signal;
use tracing::{error, info};

use crate::{
    core::app_state::AppState,
    error_handler::{AppError, AppResult},
    middleware_layer::json_extractor::json_error_mapper,
    routes::{
        diagnostics_route::{health_route, recent_webhooks_route},
        review_route::trigger_review_route,
        webhook_route::{provider_webhook_route, webhook_route},
    },
};

/// Builds the HTTP router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_route))
        .route("/webhook", post(webhook_route))
        .route("/webhook/{provider}", post(provider_webhook_route))
        .route("/api/v1/reviews", post(trigger_review_route))
        .route("/api/v1/webhooks/recent", get(recent_webhooks_route))
        .layer(middleware::from_fn(json_error_mapper))
        .with_state(state)
}

pub async fn start() -> AppResult<()> {
    let state = Arc::new(AppState::from_env()?);
    let address = state.api_address.clone();

    let app = router(state);

    // Bind to address
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(AppError::Bind)?;
    info!(address = %address, "API listening");

    // Start server with graceful shutdown on Ctrl+C
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(AppError::Server)?;

    info!("API stopped");
    Ok(())
}

/// Returns a future that resolves when Ctrl+C is pressed
async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
