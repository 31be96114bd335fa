#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use reconciliation_rs::config::Config;
use reconciliation_rs::metrics::Metrics;
use reconciliation_rs::models::{BillingInterval, Plan, SubscriptionKind};
use reconciliation_rs::processor::{MockProcessor, PaymentProcessor};
use reconciliation_rs::repos::plan_repo::{self, NewPlan};
use reconciliation_rs::stripe::webhook::signature_header;
use reconciliation_rs::{build_router, AppState};

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Connect to the test database and run migrations.
/// Returns `None` when `DATABASE_URL` is unset so the suite can run without
/// Postgres.
pub async fn setup_pool() -> Option<PgPool> {
    dotenvy::dotenv().ok();

    let url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("DATABASE_URL not set; skipping integration test");
            return None;
        }
    };

    // Small pool with short timeouts to prevent connection leaks
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .idle_timeout(Some(Duration::from_secs(30)))
        .max_lifetime(Some(Duration::from_secs(300)))
        .acquire_timeout(Duration::from_secs(5))
        .connect(&url)
        .await
        .expect("Failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    Some(pool)
}

pub fn test_config() -> Config {
    Config {
        database_url: String::new(),
        db_max_connections: 5,
        db_acquire_timeout: Duration::from_secs(5),
        host: "127.0.0.1".to_string(),
        port: 0,
        stripe_secret_key: "sk_test_unused".to_string(),
        stripe_webhook_secret: TEST_WEBHOOK_SECRET.to_string(),
        stripe_api_base: "http://localhost:0".to_string(),
        stripe_timeout: Duration::from_secs(1),
        webhook_tolerance_secs: 300,
        webhook_max_attempts: 3,
        webhook_retry_initial: Duration::from_secs(30),
        webhook_retry_max: Duration::from_secs(3600),
        sweeper_interval: Duration::from_secs(30),
        sweeper_batch_size: 50,
        default_platform_percentage: 10,
        connect_return_url: "http://localhost:3000/connect/return".to_string(),
        connect_refresh_url: "http://localhost:3000/connect/refresh".to_string(),
        checkout_success_url: "http://localhost:3000/checkout/success".to_string(),
        checkout_cancel_url: "http://localhost:3000/checkout/cancel".to_string(),
    }
}

/// Service wired to the in-memory processor
pub struct TestApp {
    pub pool: PgPool,
    pub processor: Arc<MockProcessor>,
    pub state: AppState,
}

impl TestApp {
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Send one request through a fresh router and decode the JSON body
    pub async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }
}

pub async fn setup() -> Option<TestApp> {
    let pool = setup_pool().await?;
    let processor = Arc::new(MockProcessor::new());
    let dyn_processor: Arc<dyn PaymentProcessor> = processor.clone();
    let metrics = Metrics::new().expect("metrics registry");
    let state = AppState::new(pool.clone(), test_config(), dyn_processor, metrics);

    Some(TestApp {
        pool,
        processor,
        state,
    })
}

pub fn unique_tenant() -> String {
    format!("tenant-{}", Uuid::new_v4())
}

pub fn unique_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub fn send_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Event envelope in the processor's wire shape
pub fn event(event_id: &str, event_type: &str, object: Value) -> Value {
    json!({
        "id": event_id,
        "object": "event",
        "type": event_type,
        "created": chrono::Utc::now().timestamp(),
        "livemode": false,
        "data": { "object": object }
    })
}

/// Webhook delivery signed with the test secret
pub fn signed_webhook(payload: &Value) -> Request<Body> {
    let body = payload.to_string();
    let header = signature_header(
        TEST_WEBHOOK_SECRET,
        chrono::Utc::now().timestamp(),
        body.as_bytes(),
    )
    .unwrap();

    Request::builder()
        .method("POST")
        .uri("/webhooks/payments")
        .header("content-type", "application/json")
        .header("stripe-signature", header)
        .body(Body::from(body))
        .unwrap()
}

pub async fn seed_plan(
    pool: &PgPool,
    kind: SubscriptionKind,
    tenant_id: Option<&str>,
    price_id: &str,
    amount_minor: i64,
) -> Plan {
    plan_repo::insert(
        pool,
        &NewPlan {
            plan_id: unique_id("plan"),
            kind,
            tenant_id: tenant_id.map(str::to_string),
            name: "Test Plan".to_string(),
            external_price_id: price_id.to_string(),
            amount_minor,
            currency: "usd".to_string(),
            billing_interval: BillingInterval::Month,
        },
    )
    .await
    .expect("Failed to seed plan")
}

/// Onboard a tenant and mark its account fully enabled.
/// Returns (tenant_id, external_account_id).
pub async fn seed_chargeable_tenant(app: &TestApp) -> (String, String) {
    let tenant_id = unique_tenant();
    let (status, body) = app
        .call(send_json("POST", "/connect/onboard", json!({ "tenantId": tenant_id })))
        .await;
    assert_eq!(status, StatusCode::OK, "onboarding failed: {}", body);

    let account_id = body["data"]["accountId"].as_str().unwrap().to_string();
    app.processor
        .set_account_capabilities(&account_id, true, true, vec![])
        .expect("mock account exists");

    let (status, _) = app.call(get(&format!("/connect/status/{}", account_id))).await;
    assert_eq!(status, StatusCode::OK);

    (tenant_id, account_id)
}

/// Run a member checkout through to an active local subscription.
/// Returns (external_subscription_id, local subscription id).
pub async fn seed_member_subscription(
    app: &TestApp,
    tenant_id: &str,
    user_id: &str,
    plan: &Plan,
) -> (String, String) {
    let (status, body) = app
        .call(send_json(
            "POST",
            "/member/subscribe",
            json!({ "tenantId": tenant_id, "userId": user_id, "planId": plan.plan_id }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "subscribe failed: {}", body);
    let session_id = body["data"]["sessionId"].as_str().unwrap().to_string();

    let remote = app
        .processor
        .complete_checkout(&session_id, "active")
        .expect("mock session exists");

    let (status, body) = app
        .call(send_json(
            "POST",
            "/member/checkout/confirm",
            json!({ "sessionId": session_id }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "confirm failed: {}", body);

    (remote.id, body["data"]["id"].as_str().unwrap().to_string())
}
