use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::models::{ApiResponse, ProcessedEvent, WebhookEventStatus};
use crate::state::AppState;
use crate::webhooks::engine::IngestReceipt;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhooks/payments", post(receive_webhook))
        .route("/webhooks/events", get(list_events))
        .route("/webhooks/events/{eventId}/replay", post(replay_event))
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub status: Option<WebhookEventStatus>,
    pub limit: Option<i64>,
}

/// POST /webhooks/payments - Receive a processor webhook
///
/// Returns 400 only when the delivery cannot be trusted or read. Once the
/// event is recorded the response is 200 even if dispatch failed; the
/// sweeper owns retries from there.
async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<ApiResponse<IngestReceipt>>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let receipt = state.webhooks.ingest(&body, signature).await?;
    Ok(Json(ApiResponse::ok(receipt)))
}

/// GET /webhooks/events?status&limit - Stored events, newest first
async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> AppResult<Json<ApiResponse<Vec<ProcessedEvent>>>> {
    let events = state
        .webhooks
        .list_events(query.status, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(ApiResponse::ok(events)))
}

/// POST /webhooks/events/{eventId}/replay - Re-dispatch a failed or dead-lettered event
async fn replay_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> AppResult<Json<ApiResponse<IngestReceipt>>> {
    if event_id.trim().is_empty() {
        return Err(AppError::validation("eventId is required"));
    }
    let receipt = state.webhooks.replay(&event_id).await?;
    Ok(Json(ApiResponse::ok(receipt)))
}
