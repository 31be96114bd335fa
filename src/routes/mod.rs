pub mod connect;
pub mod health;
pub mod member;
pub mod metrics;
pub mod platform;
pub mod revenue;
pub mod webhooks;

use axum::{extract::rejection::JsonRejection, middleware::from_fn_with_state, Json, Router};

use crate::error::{AppError, AppResult};
use crate::middleware::metrics::metrics_middleware;
use crate::state::AppState;

/// Full HTTP surface. Request latency is observed on matched routes only.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(connect::router())
        .merge(member::router())
        .merge(platform::router())
        .merge(revenue::router())
        .merge(webhooks::router())
        .merge(health::router())
        .route_layer(from_fn_with_state(state.metrics.clone(), metrics_middleware))
        .with_state(state)
}

/// Unwrap a JSON body, reporting malformed input in the standard error
/// envelope rather than axum's plain-text rejection
pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| AppError::validation(e.body_text()))
}

pub(crate) fn require(name: &str, value: &Option<String>) -> AppResult<String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(AppError::validation(format!("{} is required", name))),
    }
}
