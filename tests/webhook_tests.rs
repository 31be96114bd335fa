mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use reconciliation_rs::models::SubscriptionKind;
use reconciliation_rs::webhooks::sweeper::sweep_once;
use serde_json::{json, Value};
use serial_test::serial;
use sqlx::PgPool;

use common::{event, get, send_json, signed_webhook, unique_id, unique_tenant};

fn payment_intent(tenant_id: &str, intent_id: &str, charge_id: &str, amount: i64) -> Value {
    json!({
        "id": intent_id,
        "object": "payment_intent",
        "amount": amount,
        "amount_received": amount,
        "currency": "usd",
        "status": "succeeded",
        "latest_charge": charge_id,
        "metadata": { "tenant_id": tenant_id }
    })
}

fn refunded_charge(charge_id: &str, refund_id: &str, amount: i64, refunded: i64) -> Value {
    json!({
        "id": charge_id,
        "object": "charge",
        "amount": amount,
        "amount_refunded": refunded,
        "currency": "usd",
        "refunds": {
            "data": [{
                "id": refund_id,
                "amount": refunded,
                "currency": "usd",
                "status": "succeeded",
                "charge": charge_id
            }],
            "has_more": false
        }
    })
}

async fn event_row(pool: &PgPool, event_id: &str) -> Option<(String, bool, i32)> {
    sqlx::query_as(
        "SELECT status::TEXT, processed, attempt_count FROM processed_events WHERE event_id = $1",
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await
    .unwrap()
}

async fn transaction_count(pool: &PgPool, tenant_id: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM transactions WHERE tenant_id = $1")
        .bind(tenant_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

/// TEST 1: Bad signature is rejected before anything is stored
#[tokio::test]
#[serial]
async fn test_invalid_signature_stores_nothing() {
    let Some(app) = common::setup().await else { return };
    let event_id = unique_id("evt");
    let payload = event(&event_id, "payment_intent.succeeded", json!({ "id": "pi_x" }));
    let body = payload.to_string();
    let timestamp = chrono::Utc::now().timestamp();

    let forged = reconciliation_rs::stripe::webhook::signature_header("whsec_wrong", timestamp, body.as_bytes())
        .unwrap();
    let (status, response) = app
        .call(
            Request::builder()
                .method("POST")
                .uri("/webhooks/payments")
                .header("stripe-signature", forged)
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"], "signature_error");

    let (status, _) = app
        .call(
            Request::builder()
                .method("POST")
                .uri("/webhooks/payments")
                .body(Body::from(body))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(event_row(&app.pool, &event_id).await.is_none());
}

/// TEST 2: Unknown event types are stored and marked processed
#[tokio::test]
#[serial]
async fn test_unhandled_event_is_stored_as_processed() {
    let Some(app) = common::setup().await else { return };
    let event_id = unique_id("evt");
    let payload = event(&event_id, "customer.created", json!({ "id": "cus_1" }));

    let (status, body) = app.call(signed_webhook(&payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "ignored");

    let (status, processed, attempts) = event_row(&app.pool, &event_id).await.unwrap();
    assert_eq!(status, "processed");
    assert!(processed);
    assert_eq!(attempts, 1);
}

/// TEST 3: Redelivering the same payment event records it once
#[tokio::test]
#[serial]
async fn test_redelivery_is_idempotent() {
    let Some(app) = common::setup().await else { return };
    let tenant_id = unique_tenant();
    let event_id = unique_id("evt");
    let payload = event(
        &event_id,
        "payment_intent.succeeded",
        payment_intent(&tenant_id, &unique_id("pi"), &unique_id("ch"), 1000),
    );

    let (status, body) = app.call(signed_webhook(&payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "processed");

    for _ in 0..3 {
        let (status, body) = app.call(signed_webhook(&payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["outcome"], "already_processed");
    }

    assert_eq!(transaction_count(&app.pool, &tenant_id).await, 1);
    let (_, processed, attempts) = event_row(&app.pool, &event_id).await.unwrap();
    assert!(processed);
    assert_eq!(attempts, 1);
}

/// TEST 4: Payments are split with the tenant's active policy
#[tokio::test]
#[serial]
async fn test_payment_uses_active_split() {
    let Some(app) = common::setup().await else { return };
    let tenant_id = unique_tenant();
    app.call(send_json(
        "PUT",
        &format!("/connect/split/{}", tenant_id),
        json!({ "platformPercentage": 15 }),
    ))
    .await;

    let charge_id = unique_id("ch");
    let payload = event(
        &unique_id("evt"),
        "payment_intent.succeeded",
        payment_intent(&tenant_id, &unique_id("pi"), &charge_id, 2000),
    );
    app.call(signed_webhook(&payload)).await;

    let (amount, platform, creator, pct): (i64, i64, i64, i32) = sqlx::query_as(
        "SELECT amount_minor, platform_amount_minor, creator_amount_minor, platform_percentage
         FROM transactions WHERE external_charge_id = $1",
    )
    .bind(&charge_id)
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(amount, 2000);
    assert_eq!(platform, 300);
    assert_eq!(creator, 1700);
    assert_eq!(pct, 15);
}

/// TEST 5: A refund that arrives before its payment fails, then succeeds on replay
#[tokio::test]
#[serial]
async fn test_out_of_order_refund_recovers_on_replay() {
    let Some(app) = common::setup().await else { return };
    let tenant_id = unique_tenant();
    let charge_id = unique_id("ch");
    let refund_event_id = unique_id("evt");

    let refund = event(
        &refund_event_id,
        "charge.refunded",
        refunded_charge(&charge_id, &unique_id("re"), 1000, 300),
    );
    let (status, body) = app.call(signed_webhook(&refund)).await;
    assert_eq!(status, StatusCode::OK, "dispatch failures are still acknowledged");
    assert_eq!(body["data"]["outcome"], "failed");

    let (status, processed, attempts) = event_row(&app.pool, &refund_event_id).await.unwrap();
    assert_eq!(status, "failed");
    assert!(!processed);
    assert_eq!(attempts, 1);

    let (_, body) = app.call(get("/webhooks/events?status=failed&limit=500")).await;
    assert!(body["data"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["eventId"] == refund_event_id));

    let payment = event(
        &unique_id("evt"),
        "payment_intent.succeeded",
        payment_intent(&tenant_id, &unique_id("pi"), &charge_id, 1000),
    );
    app.call(signed_webhook(&payment)).await;

    let (status, body) = app
        .call(send_json(
            "POST",
            &format!("/webhooks/events/{}/replay", refund_event_id),
            json!({}),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "processed");

    let (amount, platform): (i64, i64) = sqlx::query_as(
        "SELECT amount_minor, platform_amount_minor FROM transactions
         WHERE external_charge_id = $1 AND kind = 'refund'",
    )
    .bind(&charge_id)
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(amount, -300);
    assert_eq!(platform, -30);

    let (status, body) = app
        .call(send_json(
            "POST",
            &format!("/webhooks/events/{}/replay", refund_event_id),
            json!({}),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "already_processed");

    let (status, _) = app
        .call(send_json("POST", "/webhooks/events/evt_unknown/replay", json!({})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// TEST 6: Repeated failures dead-letter the event
#[tokio::test]
#[serial]
async fn test_failures_dead_letter_after_max_attempts() {
    let Some(app) = common::setup().await else { return };
    let event_id = unique_id("evt");
    let dispute = event(
        &event_id,
        "charge.dispute.created",
        json!({
            "id": unique_id("dp"),
            "object": "dispute",
            "amount": 500,
            "currency": "usd",
            "charge": unique_id("ch"),
            "reason": "fraudulent",
            "status": "needs_response"
        }),
    );

    let (_, body) = app.call(signed_webhook(&dispute)).await;
    assert_eq!(body["data"]["outcome"], "failed");

    let replay_uri = format!("/webhooks/events/{}/replay", event_id);
    let (_, body) = app.call(send_json("POST", &replay_uri, json!({}))).await;
    assert_eq!(body["data"]["outcome"], "failed");
    let (_, body) = app.call(send_json("POST", &replay_uri, json!({}))).await;
    assert_eq!(body["data"]["outcome"], "dead_lettered");

    let (status, processed, attempts) = event_row(&app.pool, &event_id).await.unwrap();
    assert_eq!(status, "dead_lettered");
    assert!(!processed);
    assert_eq!(attempts, 3);

    // Redelivery of a dead-lettered event does not run it again
    let (status, body) = app.call(signed_webhook(&dispute)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "dead_lettered");
    let (_, _, attempts) = event_row(&app.pool, &event_id).await.unwrap();
    assert_eq!(attempts, 3);
}

/// TEST 7: The sweeper re-dispatches due events
#[tokio::test]
#[serial]
async fn test_sweeper_redispatches_due_events() {
    let Some(app) = common::setup().await else { return };
    let tenant_id = unique_tenant();
    let charge_id = unique_id("ch");
    let intent_id = unique_id("pi");
    let dispute_event_id = unique_id("evt");

    let dispute = event(
        &dispute_event_id,
        "charge.dispute.created",
        json!({
            "id": unique_id("dp"),
            "amount": 1000,
            "currency": "usd",
            "charge": charge_id,
            "payment_intent": intent_id,
            "reason": "product_not_received"
        }),
    );
    app.call(signed_webhook(&dispute)).await;

    let payment = event(
        &unique_id("evt"),
        "payment_intent.succeeded",
        payment_intent(&tenant_id, &intent_id, &charge_id, 1000),
    );
    app.call(signed_webhook(&payment)).await;

    sqlx::query("UPDATE processed_events SET next_attempt_at = NOW() - INTERVAL '1 second' WHERE event_id = $1")
        .bind(&dispute_event_id)
        .execute(&app.pool)
        .await
        .unwrap();

    let report = sweep_once(&app.state.webhooks, 500).await.unwrap();
    assert!(report.processed >= 1);

    let (status, processed, attempts) = event_row(&app.pool, &dispute_event_id).await.unwrap();
    assert_eq!(status, "processed");
    assert!(processed);
    assert_eq!(attempts, 2);

    let (amount, kind): (i64, String) = sqlx::query_as(
        "SELECT amount_minor, kind::TEXT FROM transactions
         WHERE tenant_id = $1 AND kind = 'chargeback'",
    )
    .bind(&tenant_id)
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(amount, -1000);
    assert_eq!(kind, "chargeback");
}

/// TEST 8: Subscription invoices attribute the payment; rent is all platform
#[tokio::test]
#[serial]
async fn test_invoice_payments_attach_to_subscriptions() {
    let Some(app) = common::setup().await else { return };
    let (tenant_id, _) = common::seed_chargeable_tenant(&app).await;
    let plan = common::seed_plan(&app.pool, SubscriptionKind::Member, Some(&tenant_id), "price_basic", 1000).await;
    let (external_id, subscription_id) =
        common::seed_member_subscription(&app, &tenant_id, "user-1", &plan).await;

    let charge_id = unique_id("ch");
    let invoice = event(
        &unique_id("evt"),
        "invoice.payment_succeeded",
        json!({
            "id": unique_id("in"),
            "object": "invoice",
            "charge": charge_id,
            "payment_intent": unique_id("pi"),
            "subscription": external_id,
            "customer": "cus_1",
            "amount_paid": 1000,
            "currency": "usd"
        }),
    );
    let (_, body) = app.call(signed_webhook(&invoice)).await;
    assert_eq!(body["data"]["outcome"], "processed");

    let (sub_id, platform, creator): (uuid::Uuid, i64, i64) = sqlx::query_as(
        "SELECT subscription_id, platform_amount_minor, creator_amount_minor
         FROM transactions WHERE external_charge_id = $1",
    )
    .bind(&charge_id)
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(sub_id.to_string(), subscription_id);
    assert_eq!(platform, 100);
    assert_eq!(creator, 900);

    let invoiced: bool = sqlx::query_scalar(
        "SELECT last_invoiced_at IS NOT NULL FROM subscriptions WHERE external_subscription_id = $1",
    )
    .bind(&external_id)
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert!(invoiced);

    // Rent
    let rent_plan = common::seed_plan(&app.pool, SubscriptionKind::Platform, None, "price_rent", 4900).await;
    let (_, body) = app
        .call(send_json(
            "POST",
            "/platform/subscribe",
            json!({ "tenantId": tenant_id, "planId": rent_plan.plan_id }),
        ))
        .await;
    let session_id = body["data"]["sessionId"].as_str().unwrap().to_string();
    let rent = app.processor.complete_checkout(&session_id, "active").unwrap();
    app.call(send_json("POST", "/member/checkout/confirm", json!({ "sessionId": session_id })))
        .await;

    let rent_charge = unique_id("ch");
    let rent_invoice = event(
        &unique_id("evt"),
        "invoice.paid",
        json!({
            "id": unique_id("in"),
            "charge": rent_charge,
            "subscription": rent.id,
            "amount_paid": 4900,
            "currency": "usd"
        }),
    );
    app.call(signed_webhook(&rent_invoice)).await;

    let (platform, creator, pct): (i64, i64, i32) = sqlx::query_as(
        "SELECT platform_amount_minor, creator_amount_minor, platform_percentage
         FROM transactions WHERE external_charge_id = $1",
    )
    .bind(&rent_charge)
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(platform, 4900);
    assert_eq!(creator, 0);
    assert_eq!(pct, 100);
}

/// TEST 9: An invoice for a subscription not yet recorded is retried later
#[tokio::test]
#[serial]
async fn test_invoice_for_unknown_subscription_fails_for_retry() {
    let Some(app) = common::setup().await else { return };
    let event_id = unique_id("evt");
    let invoice = event(
        &event_id,
        "invoice.payment_succeeded",
        json!({
            "id": unique_id("in"),
            "charge": unique_id("ch"),
            "subscription": unique_id("sub"),
            "amount_paid": 1000,
            "currency": "usd"
        }),
    );

    let (status, body) = app.call(signed_webhook(&invoice)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "failed");

    let (status, _, _) = event_row(&app.pool, &event_id).await.unwrap();
    assert_eq!(status, "failed");
}

/// TEST 10: Failed payments are kept for audit
#[tokio::test]
#[serial]
async fn test_failed_payment_is_recorded() {
    let Some(app) = common::setup().await else { return };
    let tenant_id = unique_tenant();
    let intent_id = unique_id("pi");
    let payload = event(
        &unique_id("evt"),
        "payment_intent.payment_failed",
        json!({
            "id": intent_id,
            "amount": 1200,
            "currency": "usd",
            "status": "requires_payment_method",
            "metadata": { "tenant_id": tenant_id },
            "last_payment_error": { "code": "card_declined", "message": "Your card was declined." }
        }),
    );
    let (_, body) = app.call(signed_webhook(&payload)).await;
    assert_eq!(body["data"]["outcome"], "processed");

    let (status, reason): (String, Option<String>) = sqlx::query_as(
        "SELECT status::TEXT, failure_reason FROM transactions WHERE external_payment_intent_id = $1",
    )
    .bind(&intent_id)
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(status, "failed");
    assert_eq!(reason.as_deref(), Some("Your card was declined."));
}

/// TEST 11: Concurrent deliveries of one event apply it exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_concurrent_deliveries_apply_once() {
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    let Some(app) = common::setup().await else { return };
    let tenant_id = unique_tenant();
    let payload = event(
        &unique_id("evt"),
        "payment_intent.succeeded",
        payment_intent(&tenant_id, &unique_id("pi"), &unique_id("ch"), 1000),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let router = app.router();
        let request = signed_webhook(&payload);
        handles.push(tokio::spawn(async move {
            let response = router.oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let body: Value = serde_json::from_slice(&bytes).unwrap();
            (status, body["data"]["outcome"].as_str().unwrap_or_default().to_string())
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        let (status, outcome) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        outcomes.push(outcome);
    }

    assert_eq!(outcomes.iter().filter(|o| *o == "processed").count(), 1, "{:?}", outcomes);
    assert!(outcomes
        .iter()
        .all(|o| ["processed", "in_flight", "already_processed"].contains(&o.as_str())));
    assert_eq!(transaction_count(&app.pool, &tenant_id).await, 1);
}
