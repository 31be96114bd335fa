use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{BillingInterval, Subscription, SubscriptionKind, SubscriptionStatus};

/// Full row content for a subscription first seen locally
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub kind: SubscriptionKind,
    pub tenant_id: String,
    pub payer_id: String,
    pub plan_id: String,
    pub external_subscription_id: String,
    pub external_customer_id: String,
    pub state: SubscriptionState,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Lifecycle fields that follow the processor's subscription object
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionState {
    pub status: SubscriptionStatus,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub amount_minor: i64,
    pub currency: String,
    pub billing_interval: BillingInterval,
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn find_by_external_id(
    pool: &PgPool,
    external_subscription_id: &str,
) -> Result<Option<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions WHERE external_subscription_id = $1",
    )
    .bind(external_subscription_id)
    .fetch_optional(pool)
    .await
}

/// Active or trialing subscription for a (tenant, payer, kind) triple
pub async fn find_live_for_payer(
    pool: &PgPool,
    tenant_id: &str,
    payer_id: &str,
    kind: SubscriptionKind,
) -> Result<Option<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(
        r#"
        SELECT * FROM subscriptions
        WHERE tenant_id = $1 AND payer_id = $2 AND kind = $3
          AND status IN ('active', 'trialing')
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(tenant_id)
    .bind(payer_id)
    .bind(kind)
    .fetch_optional(pool)
    .await
}

/// Most relevant subscription for a payer: a live one if present, else the
/// newest
pub async fn find_current_for_payer(
    pool: &PgPool,
    tenant_id: &str,
    payer_id: &str,
    kind: SubscriptionKind,
) -> Result<Option<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(
        r#"
        SELECT * FROM subscriptions
        WHERE tenant_id = $1 AND payer_id = $2 AND kind = $3
        ORDER BY (status IN ('active', 'trialing')) DESC, created_at DESC
        LIMIT 1
        "#,
    )
    .bind(tenant_id)
    .bind(payer_id)
    .bind(kind)
    .fetch_optional(pool)
    .await
}

pub async fn list_for_tenant(
    pool: &PgPool,
    tenant_id: &str,
    kind: SubscriptionKind,
) -> Result<Vec<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(
        r#"
        SELECT * FROM subscriptions
        WHERE tenant_id = $1 AND kind = $2
        ORDER BY created_at DESC
        "#,
    )
    .bind(tenant_id)
    .bind(kind)
    .fetch_all(pool)
    .await
}

/// Insert unless a row for the external id already exists. `None` means
/// another writer got there first.
pub async fn insert_if_absent(
    pool: &PgPool,
    subscription: &NewSubscription,
) -> Result<Option<Subscription>, sqlx::Error> {
    let state = &subscription.state;
    sqlx::query_as::<_, Subscription>(
        r#"
        INSERT INTO subscriptions (
            id, kind, tenant_id, payer_id, external_subscription_id, external_customer_id,
            plan_id, status, current_period_start, current_period_end, trial_start, trial_end,
            cancel_at_period_end, canceled_at, amount_minor, currency, billing_interval,
            last_event_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        ON CONFLICT (external_subscription_id) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(subscription.kind)
    .bind(&subscription.tenant_id)
    .bind(&subscription.payer_id)
    .bind(&subscription.external_subscription_id)
    .bind(&subscription.external_customer_id)
    .bind(&subscription.plan_id)
    .bind(state.status)
    .bind(state.current_period_start)
    .bind(state.current_period_end)
    .bind(state.trial_start)
    .bind(state.trial_end)
    .bind(state.cancel_at_period_end)
    .bind(state.canceled_at)
    .bind(state.amount_minor)
    .bind(&state.currency)
    .bind(state.billing_interval)
    .bind(subscription.last_event_at)
    .fetch_optional(pool)
    .await
}

/// Optimistic update guarded by `version`. `None` means the row changed
/// since it was read, or that a newer notification was applied than the one
/// observed at `observed_at`. Amount, currency and interval are frozen once a
/// period has been invoiced.
pub async fn update_state(
    pool: &PgPool,
    id: Uuid,
    expected_version: i32,
    state: &SubscriptionState,
    observed_at: Option<DateTime<Utc>>,
) -> Result<Option<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(
        r#"
        UPDATE subscriptions
        SET status = $3,
            current_period_start = $4,
            current_period_end = $5,
            trial_start = $6,
            trial_end = $7,
            cancel_at_period_end = $8,
            canceled_at = $9,
            amount_minor = CASE WHEN last_invoiced_at IS NULL THEN $10 ELSE amount_minor END,
            currency = CASE WHEN last_invoiced_at IS NULL THEN $11 ELSE currency END,
            billing_interval = CASE WHEN last_invoiced_at IS NULL THEN $12 ELSE billing_interval END,
            last_event_at = CASE
                WHEN $13::TIMESTAMPTZ IS NULL THEN last_event_at
                ELSE GREATEST(COALESCE(last_event_at, $13), $13)
            END,
            version = version + 1,
            updated_at = NOW()
        WHERE id = $1
          AND version = $2
          AND ($13::TIMESTAMPTZ IS NULL OR last_event_at IS NULL OR last_event_at <= $13)
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(expected_version)
    .bind(state.status)
    .bind(state.current_period_start)
    .bind(state.current_period_end)
    .bind(state.trial_start)
    .bind(state.trial_end)
    .bind(state.cancel_at_period_end)
    .bind(state.canceled_at)
    .bind(state.amount_minor)
    .bind(&state.currency)
    .bind(state.billing_interval)
    .bind(observed_at)
    .fetch_optional(pool)
    .await
}

/// Record that a period was invoiced, freezing amount and currency
pub async fn mark_invoiced(
    pool: &PgPool,
    id: Uuid,
    invoiced_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE subscriptions
        SET last_invoiced_at = GREATEST(COALESCE(last_invoiced_at, $2), $2)
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(invoiced_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn insert_anomaly(
    pool: &PgPool,
    external_subscription_id: &str,
    from_status: SubscriptionStatus,
    to_status: SubscriptionStatus,
    reason: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO subscription_anomalies (id, external_subscription_id, from_status, to_status, reason)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(external_subscription_id)
    .bind(from_status)
    .bind(to_status)
    .bind(reason)
    .execute(pool)
    .await?;

    Ok(())
}
