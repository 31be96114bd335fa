use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{json_body, require};
use crate::error::{AppError, AppResult};
use crate::models::{ApiResponse, Plan, Subscription, SubscriptionKind};
use crate::repos::plan_repo;
use crate::services::subscription_ledger::{CheckoutRef, CheckoutRequest};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/member/plans/{tenantId}", get(list_plans))
        .route("/member/subscribe", post(subscribe))
        .route("/member/checkout/confirm", post(confirm_checkout))
        // Both routes share the first segment name; matchit rejects differing
        // parameter names at one position.
        .route("/member/subscription/{id}/{userId}", get(get_subscription))
        .route("/member/subscription/{id}/cancel", post(cancel_subscription))
        .route("/member/subscriptions/{tenantId}", get(list_subscriptions))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeBody {
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub plan_id: Option<String>,
    pub trial_days: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmBody {
    pub session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBody {
    #[serde(default)]
    pub at_period_end: bool,
}

/// GET /member/plans/{tenantId} - Active plans a member can buy
async fn list_plans(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<ApiResponse<Vec<Plan>>>> {
    let plans = plan_repo::list_member_plans(&state.pool, &tenant_id).await?;
    Ok(Json(ApiResponse::ok(plans)))
}

/// POST /member/subscribe - Open a hosted checkout for a member plan
async fn subscribe(
    State(state): State<AppState>,
    payload: Result<Json<SubscribeBody>, JsonRejection>,
) -> AppResult<Json<ApiResponse<CheckoutRef>>> {
    let body = json_body(payload)?;
    let request = CheckoutRequest {
        kind: SubscriptionKind::Member,
        tenant_id: require("tenantId", &body.tenant_id)?,
        payer_id: require("userId", &body.user_id)?,
        plan_id: require("planId", &body.plan_id)?,
        trial_days: body.trial_days,
    };

    let checkout = state.subscriptions.create_checkout(&request).await?;
    Ok(Json(ApiResponse::ok(checkout)))
}

/// POST /member/checkout/confirm - Record the subscription behind a finished checkout
async fn confirm_checkout(
    State(state): State<AppState>,
    payload: Result<Json<ConfirmBody>, JsonRejection>,
) -> AppResult<Json<ApiResponse<Subscription>>> {
    let body = json_body(payload)?;
    let session_id = require("sessionId", &body.session_id)?;

    let subscription = state.subscriptions.confirm_checkout(&session_id).await?;
    Ok(Json(ApiResponse::ok(subscription)))
}

/// GET /member/subscription/{tenantId}/{userId}
async fn get_subscription(
    State(state): State<AppState>,
    Path((tenant_id, user_id)): Path<(String, String)>,
) -> AppResult<Json<ApiResponse<Subscription>>> {
    let subscription = state
        .subscriptions
        .get_member_subscription(&tenant_id, &user_id)
        .await?;
    Ok(Json(ApiResponse::ok(subscription)))
}

/// GET /member/subscriptions/{tenantId}
async fn list_subscriptions(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<ApiResponse<Vec<Subscription>>>> {
    let subscriptions = state.subscriptions.list_member_subscriptions(&tenant_id).await?;
    Ok(Json(ApiResponse::ok(subscriptions)))
}

/// POST /member/subscription/{subscriptionId}/cancel
async fn cancel_subscription(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
    raw_body: Bytes,
) -> AppResult<Json<ApiResponse<Subscription>>> {
    let subscription_id = Uuid::parse_str(&subscription_id)
        .map_err(|_| AppError::validation(format!("Invalid subscription id {}", subscription_id)))?;
    // The body is optional; an empty one cancels immediately
    let body: CancelBody = if raw_body.is_empty() {
        CancelBody::default()
    } else {
        serde_json::from_slice(&raw_body)
            .map_err(|e| AppError::validation(format!("Invalid request body: {}", e)))?
    };

    let subscription = state
        .subscriptions
        .cancel(subscription_id, body.at_period_end)
        .await?;
    Ok(Json(ApiResponse::ok(subscription)))
}
