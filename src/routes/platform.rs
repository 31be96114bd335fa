use axum::{
    extract::{rejection::JsonRejection, Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use super::{json_body, require};
use crate::error::AppResult;
use crate::models::{ApiResponse, Subscription, SubscriptionKind};
use crate::services::subscription_ledger::{CheckoutRef, CheckoutRequest};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/platform/subscribe", post(subscribe))
        .route("/platform/subscription/{tenantId}", get(get_subscription))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSubscribeBody {
    pub tenant_id: Option<String>,
    pub plan_id: Option<String>,
    pub trial_days: Option<u32>,
}

/// POST /platform/subscribe - Open a hosted checkout for the tenant's rent plan
async fn subscribe(
    State(state): State<AppState>,
    payload: Result<Json<PlatformSubscribeBody>, JsonRejection>,
) -> AppResult<Json<ApiResponse<CheckoutRef>>> {
    let body = json_body(payload)?;
    let tenant_id = require("tenantId", &body.tenant_id)?;
    let request = CheckoutRequest {
        kind: SubscriptionKind::Platform,
        payer_id: tenant_id.clone(),
        tenant_id,
        plan_id: require("planId", &body.plan_id)?,
        trial_days: body.trial_days,
    };

    let checkout = state.subscriptions.create_checkout(&request).await?;
    Ok(Json(ApiResponse::ok(checkout)))
}

/// GET /platform/subscription/{tenantId}
async fn get_subscription(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<ApiResponse<Subscription>>> {
    let subscription = state.subscriptions.get_platform_subscription(&tenant_id).await?;
    Ok(Json(ApiResponse::ok(subscription)))
}
