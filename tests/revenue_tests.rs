mod common;

use axum::http::StatusCode;
use chrono::{Duration, SecondsFormat, Utc};
use serde_json::{json, Value};
use serial_test::serial;

use common::{event, get, send_json, signed_webhook, unique_id, unique_tenant, TestApp};

fn window_uri(tenant_id: &str) -> String {
    let start = (Utc::now() - Duration::hours(1)).to_rfc3339_opts(SecondsFormat::Secs, true);
    let end = (Utc::now() + Duration::hours(1)).to_rfc3339_opts(SecondsFormat::Secs, true);
    format!("/revenue/{}?start={}&end={}", tenant_id, start, end)
}

async fn pay(app: &TestApp, tenant_id: &str, charge_id: &str, amount: i64) {
    let payload = event(
        &unique_id("evt"),
        "payment_intent.succeeded",
        json!({
            "id": unique_id("pi"),
            "amount": amount,
            "currency": "usd",
            "status": "succeeded",
            "latest_charge": charge_id,
            "metadata": { "tenant_id": tenant_id }
        }),
    );
    let (_, body) = app.call(signed_webhook(&payload)).await;
    assert_eq!(body["data"]["outcome"], "processed", "{}", body);
}

async fn revenue(app: &TestApp, tenant_id: &str) -> Value {
    let (status, body) = app.call(get(&window_uri(tenant_id))).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    body["data"].clone()
}

/// TEST 1: Refunds net against payments in the same period
#[tokio::test]
#[serial]
async fn test_refund_nets_against_payment() {
    let Some(app) = common::setup().await else { return };
    let tenant_id = unique_tenant();
    let charge_id = unique_id("ch");

    pay(&app, &tenant_id, &charge_id, 1000).await;

    let refund = event(
        &unique_id("evt"),
        "charge.refunded",
        json!({
            "id": charge_id,
            "amount": 1000,
            "amount_refunded": 300,
            "currency": "usd"
        }),
    );
    let (_, body) = app.call(signed_webhook(&refund)).await;
    assert_eq!(body["data"]["outcome"], "processed");

    let summary = revenue(&app, &tenant_id).await;
    assert_eq!(summary["totalRevenue"], 700);
    assert_eq!(summary["platformRevenue"], 70);
    assert_eq!(summary["creatorRevenue"], 630);
    assert_eq!(summary["transactionCount"], 2);

    // Same cumulative refund delivered again under a new event id
    let again = event(
        &unique_id("evt"),
        "charge.refunded",
        json!({
            "id": charge_id,
            "amount": 1000,
            "amount_refunded": 300,
            "currency": "usd"
        }),
    );
    app.call(signed_webhook(&again)).await;
    assert_eq!(revenue(&app, &tenant_id).await["totalRevenue"], 700);
}

/// TEST 2: Failed payments are excluded from revenue
#[tokio::test]
#[serial]
async fn test_failed_payments_excluded() {
    let Some(app) = common::setup().await else { return };
    let tenant_id = unique_tenant();

    pay(&app, &tenant_id, &unique_id("ch"), 500).await;

    let failed = event(
        &unique_id("evt"),
        "payment_intent.payment_failed",
        json!({
            "id": unique_id("pi"),
            "amount": 9999,
            "currency": "usd",
            "status": "requires_payment_method",
            "metadata": { "tenant_id": tenant_id }
        }),
    );
    app.call(signed_webhook(&failed)).await;

    let summary = revenue(&app, &tenant_id).await;
    assert_eq!(summary["totalRevenue"], 500);
    assert_eq!(summary["transactionCount"], 1);
}

/// TEST 3: A split change applies to later payments only
#[tokio::test]
#[serial]
async fn test_split_change_is_not_retroactive() {
    let Some(app) = common::setup().await else { return };
    let tenant_id = unique_tenant();

    pay(&app, &tenant_id, &unique_id("ch"), 1000).await;

    let (status, _) = app
        .call(send_json(
            "PUT",
            &format!("/connect/split/{}", tenant_id),
            json!({ "platformPercentage": 30 }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    pay(&app, &tenant_id, &unique_id("ch"), 1000).await;

    let summary = revenue(&app, &tenant_id).await;
    assert_eq!(summary["totalRevenue"], 2000);
    assert_eq!(summary["platformRevenue"], 400);
    assert_eq!(summary["creatorRevenue"], 1600);

    let (status, body) = app
        .call(get(&format!("/revenue/{}/transactions", tenant_id)))
        .await;
    assert_eq!(status, StatusCode::OK);
    let percentages: Vec<i64> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["platformPercentage"].as_i64().unwrap())
        .collect();
    assert_eq!(percentages, vec![10, 30]);
}

/// TEST 4: Bounds are required and ordered
#[tokio::test]
#[serial]
async fn test_revenue_bounds_validation() {
    let Some(app) = common::setup().await else { return };
    let tenant_id = unique_tenant();

    let (status, body) = app
        .call(get(&format!("/revenue/{}?end=2026-01-01T00:00:00Z", tenant_id)))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, _) = app
        .call(get(&format!(
            "/revenue/{}?start=2026-02-01T00:00:00Z&end=2026-01-01T00:00:00Z",
            tenant_id
        )))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let summary = revenue(&app, &tenant_id).await;
    assert_eq!(summary["totalRevenue"], 0);
    assert_eq!(summary["transactionCount"], 0);
}

/// TEST 5: A payment refunded in parts nets both shares to zero
#[tokio::test]
#[serial]
async fn test_partial_refunds_net_shares_to_zero() {
    let Some(app) = common::setup().await else { return };
    let tenant_id = unique_tenant();
    let charge_id = unique_id("ch");

    // 35 at 10% splits 4 / 31
    pay(&app, &tenant_id, &charge_id, 35).await;

    for refunded in [25, 35] {
        let refund = event(
            &unique_id("evt"),
            "charge.refunded",
            json!({
                "id": charge_id,
                "amount": 35,
                "amount_refunded": refunded,
                "currency": "usd"
            }),
        );
        let (_, body) = app.call(signed_webhook(&refund)).await;
        assert_eq!(body["data"]["outcome"], "processed", "{}", body);
    }

    let summary = revenue(&app, &tenant_id).await;
    assert_eq!(summary["totalRevenue"], 0);
    assert_eq!(summary["platformRevenue"], 0);
    assert_eq!(summary["creatorRevenue"], 0);
    assert_eq!(summary["transactionCount"], 3);

    let (_, body) = app
        .call(get(&format!("/revenue/{}/transactions", tenant_id)))
        .await;
    let shares: Vec<(i64, i64)> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| {
            (
                t["platformAmountMinor"].as_i64().unwrap(),
                t["creatorAmountMinor"].as_i64().unwrap(),
            )
        })
        .collect();
    assert_eq!(shares, vec![(4, 31), (-3, -22), (-1, -9)]);
}
