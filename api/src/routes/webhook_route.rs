use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use chrono::Utc;
use git_context_engine::{
    GitContextEngineError,
    errors::GitContextEngineWebhookError,
    webhooks::{WebhookAdapter, WebhookKind, sanitize_headers},
};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::core::{app_state::AppState, diagnostics::WebhookRecord, http::response_envelope::ApiResponse};

/// Acknowledgment returned to the provider for every delivery.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct WebhookAck {
    /// `accepted` when an event was queued, `ignored` otherwise.
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<&'static str>,
    pub event_type: String,
}

/// POST /webhook
///
/// Provider is detected from headers and body.
#[instrument(name = "webhook_route", skip_all)]
pub async fn webhook_route(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let ack = ingest_webhook(&state, None, &headers, &body);
    ApiResponse::success(ack).into_response_with_status(StatusCode::OK)
}

/// POST /webhook/{provider}
#[instrument(name = "provider_webhook_route", skip(state, headers, body))]
pub async fn provider_webhook_route(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ack = ingest_webhook(&state, Some(&provider), &headers, &body);
    ApiResponse::success(ack).into_response_with_status(StatusCode::OK)
}

/// Converts a delivery and queues its handling. Never fails: whatever goes
/// wrong is logged and recorded, the sender always gets an acknowledgment.
pub fn ingest_webhook(
    state: &Arc<AppState>,
    provider_hint: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> WebhookAck {
    let adapter = match provider_hint {
        Some(p) => state.registry.by_name(p).filter(|a| a.can_handle(headers, body)),
        None => state.registry.detect(headers, body),
    };

    let Some(adapter) = adapter else {
        warn!(hint = provider_hint.unwrap_or("-"), bytes = body.len(), "no adapter accepts this delivery");
        record(state, None, "unknown".into(), headers, "no matching adapter".into());
        return WebhookAck {
            status: "ignored",
            provider: None,
            event_type: "unknown".into(),
        };
    };

    let provider = adapter.provider_name();
    let event_type = adapter.event_type(headers, body);

    let converted = match adapter.classify(headers, body) {
        WebhookKind::Comment => adapter.convert_comment_event(headers, body),
        WebhookKind::ReviewerChange => adapter.convert_reviewer_event(headers, body),
        WebhookKind::Unsupported => {
            info!(provider, event_type = %event_type, "unsupported webhook event");
            record(state, Some(provider), event_type.clone(), headers, "unsupported event".into());
            return WebhookAck {
                status: "ignored",
                provider: Some(provider),
                event_type,
            };
        }
    };

    let event = match converted {
        Ok(event) => event,
        Err(GitContextEngineError::Webhook(GitContextEngineWebhookError::Ignored { reason, .. })) => {
            info!(provider, event_type = %event_type, reason = %reason, "webhook event ignored");
            record(state, Some(provider), event_type.clone(), headers, format!("ignored: {reason}"));
            return WebhookAck {
                status: "ignored",
                provider: Some(provider),
                event_type,
            };
        }
        Err(e) => {
            warn!(provider, event_type = %event_type, error = %e, "webhook conversion failed");
            record(state, Some(provider), event_type.clone(), headers, format!("conversion failed: {e}"));
            return WebhookAck {
                status: "ignored",
                provider: Some(provider),
                event_type,
            };
        }
    };

    info!(
        provider,
        event_type = %event_type,
        repo = %event.repository.full_name,
        mr = event.merge_request.as_ref().map(|m| m.number).unwrap_or_default(),
        "webhook event accepted"
    );
    record(state, Some(provider), event_type.clone(), headers, "accepted".into());

    let responder = state.responder.clone();
    tokio::spawn(async move {
        let t0 = Instant::now();
        let adapter: Arc<dyn WebhookAdapter> = adapter;
        match responder.handle_event(adapter.as_ref(), &event).await {
            Ok(outcome) => info!(
                provider,
                outcome = ?outcome,
                latency_ms = t0.elapsed().as_millis() as u64,
                "webhook processing finished"
            ),
            Err(e) => error!(
                provider,
                error = %e,
                latency_ms = t0.elapsed().as_millis() as u64,
                "webhook processing failed"
            ),
        }
    });

    WebhookAck {
        status: "accepted",
        provider: Some(provider),
        event_type,
    }
}

fn record(
    state: &AppState,
    provider: Option<&'static str>,
    event_type: String,
    headers: &HeaderMap,
    outcome: String,
) {
    state.diagnostics.record(WebhookRecord {
        received_at: Utc::now(),
        provider: provider.map(str::to_string),
        event_type,
        headers: sanitize_headers(headers),
        outcome,
    });
}
