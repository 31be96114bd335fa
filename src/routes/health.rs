use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(super::metrics::metrics))
}

pub async fn health_live() -> StatusCode {
    StatusCode::OK
}

pub async fn health_ready(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let db_up = sqlx::query("SELECT 1").fetch_one(&state.pool).await.is_ok();
    state
        .metrics
        .dep_up
        .with_label_values(&["db"])
        .set(if db_up { 1 } else { 0 });

    if !db_up {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(json!({
        "status": "ready",
        "database": "connected"
    })))
}
