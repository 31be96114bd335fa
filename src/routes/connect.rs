use axum::{
    extract::{rejection::JsonRejection, Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use super::{json_body, require};
use crate::error::AppResult;
use crate::models::{AccountType, ApiResponse, RevenueSplit};
use crate::services::account_registry::{AccountStatus, AccountView, OnboardingLink, OnboardingRequest};
use crate::services::revenue_split::{self, SplitView};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/connect/onboard", post(onboard))
        .route("/connect/status/{accountId}", get(account_status))
        .route("/connect/refresh", post(refresh_link))
        .route("/connect/account/{tenantId}", get(get_account))
        .route("/connect/split/{tenantId}", get(get_split).put(set_split))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardBody {
    pub tenant_id: Option<String>,
    pub country: Option<String>,
    pub business_type: Option<String>,
    pub email: Option<String>,
    pub account_type: Option<AccountType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshBody {
    pub tenant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitBody {
    pub platform_percentage: i32,
}

/// POST /connect/onboard - Create the tenant's connected account
async fn onboard(
    State(state): State<AppState>,
    payload: Result<Json<OnboardBody>, JsonRejection>,
) -> AppResult<Json<ApiResponse<OnboardingLink>>> {
    let body = json_body(payload)?;
    let request = OnboardingRequest {
        tenant_id: require("tenantId", &body.tenant_id)?,
        account_type: body.account_type.unwrap_or(AccountType::Express),
        country: body.country.unwrap_or_else(|| "US".to_string()),
        business_type: body.business_type.unwrap_or_else(|| "individual".to_string()),
        email: body.email,
        return_url: state.config.connect_return_url.clone(),
        refresh_url: state.config.connect_refresh_url.clone(),
    };

    let link = state.accounts.begin_onboarding(&request).await?;
    Ok(Json(ApiResponse::ok(link)))
}

/// GET /connect/status/{accountId} - Live verification and capability state
async fn account_status(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> AppResult<Json<ApiResponse<AccountStatus>>> {
    let status = state.accounts.sync_status(&account_id).await?;
    Ok(Json(ApiResponse::ok(status)))
}

/// POST /connect/refresh - Issue a new onboarding link
async fn refresh_link(
    State(state): State<AppState>,
    payload: Result<Json<RefreshBody>, JsonRejection>,
) -> AppResult<Json<ApiResponse<OnboardingLink>>> {
    let body = json_body(payload)?;
    let tenant_id = require("tenantId", &body.tenant_id)?;

    let link = state
        .accounts
        .refresh_onboarding_link(
            &tenant_id,
            &state.config.connect_return_url,
            &state.config.connect_refresh_url,
        )
        .await?;
    Ok(Json(ApiResponse::ok(link)))
}

/// GET /connect/account/{tenantId} - Stored account with live status
async fn get_account(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<ApiResponse<AccountView>>> {
    let view = state.accounts.get_account(&tenant_id).await?;
    Ok(Json(ApiResponse::ok(view)))
}

/// GET /connect/split/{tenantId}
async fn get_split(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<ApiResponse<SplitView>>> {
    let view = revenue_split::get_split(
        &state.pool,
        &tenant_id,
        state.config.default_platform_percentage,
    )
    .await?;
    Ok(Json(ApiResponse::ok(view)))
}

/// PUT /connect/split/{tenantId} - Replace the tenant's split for future payments
async fn set_split(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    payload: Result<Json<SplitBody>, JsonRejection>,
) -> AppResult<Json<ApiResponse<RevenueSplit>>> {
    let body = json_body(payload)?;
    let split = revenue_split::set_split(&state.pool, &tenant_id, body.platform_percentage).await?;
    Ok(Json(ApiResponse::ok(split)))
}
