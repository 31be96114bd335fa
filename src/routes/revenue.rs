use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::require;
use crate::error::{AppError, AppResult};
use crate::models::{ApiResponse, Transaction};
use crate::services::transaction_ledger::RevenueSummary;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/revenue/{tenantId}", get(revenue_for_period))
        .route("/revenue/{tenantId}/transactions", get(list_transactions))
}

#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    pub start: Option<String>,
    pub end: Option<String>,
}

fn parse_bound(name: &str, raw: &Option<String>) -> AppResult<DateTime<Utc>> {
    let raw = require(name, raw)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| AppError::validation(format!("{} must be an RFC 3339 timestamp", name)))
}

/// GET /revenue/{tenantId}?start&end - Net revenue in [start, end)
async fn revenue_for_period(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(query): Query<PeriodQuery>,
) -> AppResult<Json<ApiResponse<RevenueSummary>>> {
    let start = parse_bound("start", &query.start)?;
    let end = parse_bound("end", &query.end)?;

    let summary = state
        .transactions
        .revenue_for_period(&tenant_id, start, end)
        .await?;
    Ok(Json(ApiResponse::ok(summary)))
}

/// GET /revenue/{tenantId}/transactions - Ledger rows in processing order
async fn list_transactions(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<ApiResponse<Vec<Transaction>>>> {
    let rows = state.transactions.list_for_tenant(&tenant_id).await?;
    Ok(Json(ApiResponse::ok(rows)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bound_accepts_offsets() {
        let parsed = parse_bound("start", &Some("2026-03-01T02:00:00+02:00".into())).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-03-01T00:00:00+00:00");
    }

    #[test]
    fn test_parse_bound_rejects_missing_and_garbage() {
        assert!(matches!(parse_bound("end", &None), Err(AppError::Validation(_))));
        assert!(matches!(
            parse_bound("end", &Some("yesterday".into())),
            Err(AppError::Validation(_))
        ));
    }
}
