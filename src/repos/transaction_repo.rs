use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::models::{SubscriptionKind, Transaction, TransactionKind, TransactionStatus};

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub tenant_id: String,
    /// Ledger idempotency key, unique per kind
    pub external_id: String,
    pub external_charge_id: Option<String>,
    pub external_payment_intent_id: Option<String>,
    pub subscription_id: Option<Uuid>,
    pub subscription_kind: Option<SubscriptionKind>,
    pub kind: TransactionKind,
    pub amount_minor: i64,
    pub currency: String,
    pub platform_amount_minor: i64,
    pub creator_amount_minor: i64,
    pub platform_percentage: i32,
    pub status: TransactionStatus,
    pub failure_reason: Option<String>,
    pub metadata: JsonValue,
}

/// Aggregated succeeded rows for one tenant and period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct PeriodTotals {
    pub total_minor: i64,
    pub platform_minor: i64,
    pub creator_minor: i64,
    pub transaction_count: i64,
}

/// Refunds and chargebacks already recorded against one payment, as
/// non-negative magnitudes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct ReversedTotals {
    pub amount_minor: i64,
    pub platform_minor: i64,
}

/// Append a ledger row. `None` means a row with the same (kind, external_id)
/// is already recorded.
pub async fn insert(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    txn: &NewTransaction,
) -> Result<Option<Transaction>, sqlx::Error> {
    sqlx::query_as::<_, Transaction>(
        r#"
        INSERT INTO transactions (
            id, tenant_id, external_id, external_charge_id, external_payment_intent_id,
            subscription_id, subscription_kind, kind, amount_minor, currency,
            platform_amount_minor, creator_amount_minor, platform_percentage,
            status, failure_reason, processed_at, metadata
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW(), $16)
        ON CONFLICT (kind, external_id) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&txn.tenant_id)
    .bind(&txn.external_id)
    .bind(&txn.external_charge_id)
    .bind(&txn.external_payment_intent_id)
    .bind(txn.subscription_id)
    .bind(txn.subscription_kind)
    .bind(txn.kind)
    .bind(txn.amount_minor)
    .bind(&txn.currency)
    .bind(txn.platform_amount_minor)
    .bind(txn.creator_amount_minor)
    .bind(txn.platform_percentage)
    .bind(txn.status)
    .bind(&txn.failure_reason)
    .bind(&txn.metadata)
    .fetch_optional(&mut **tx)
    .await
}

/// The succeeded payment a refund or dispute reverses, matched by charge id
/// or, when the payment was recorded without one, by payment intent. The row
/// stays locked until the caller's transaction ends so concurrent reversals
/// of one payment apply one at a time.
pub async fn lock_original_payment(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    charge_id: &str,
    payment_intent_id: Option<&str>,
) -> Result<Option<Transaction>, sqlx::Error> {
    sqlx::query_as::<_, Transaction>(
        r#"
        SELECT * FROM transactions
        WHERE kind = 'payment'
          AND status = 'succeeded'
          AND (external_charge_id = $1
               OR ($2::TEXT IS NOT NULL AND external_payment_intent_id = $2))
        ORDER BY processed_at ASC
        LIMIT 1
        FOR UPDATE
        "#,
    )
    .bind(charge_id)
    .bind(payment_intent_id)
    .fetch_optional(&mut **tx)
    .await
}

pub async fn reversed_totals(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    original_transaction_id: Uuid,
) -> Result<ReversedTotals, sqlx::Error> {
    sqlx::query_as::<_, ReversedTotals>(
        r#"
        SELECT
            COALESCE(SUM(-amount_minor), 0)::BIGINT AS amount_minor,
            COALESCE(SUM(-platform_amount_minor), 0)::BIGINT AS platform_minor
        FROM transactions
        WHERE kind IN ('refund', 'chargeback')
          AND status = 'succeeded'
          AND metadata->>'originalTransactionId' = $1
        "#,
    )
    .bind(original_transaction_id.to_string())
    .fetch_one(&mut **tx)
    .await
}

/// Magnitude already refunded against a charge
pub async fn refunded_total_for_charge(pool: &PgPool, charge_id: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COALESCE(SUM(-amount_minor), 0)::BIGINT
        FROM transactions
        WHERE kind = 'refund' AND status = 'succeeded' AND external_charge_id = $1
        "#,
    )
    .bind(charge_id)
    .fetch_one(pool)
    .await
}

pub async fn list_for_tenant(pool: &PgPool, tenant_id: &str) -> Result<Vec<Transaction>, sqlx::Error> {
    sqlx::query_as::<_, Transaction>(
        r#"
        SELECT * FROM transactions
        WHERE tenant_id = $1
        ORDER BY processed_at ASC, id ASC
        "#,
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
}

/// Net succeeded money movement in `[start, end)`. Refund and chargeback rows
/// carry negative amounts, so a plain sum nets them against payments.
pub async fn period_totals(
    pool: &PgPool,
    tenant_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<PeriodTotals, sqlx::Error> {
    sqlx::query_as::<_, PeriodTotals>(
        r#"
        SELECT
            COALESCE(SUM(amount_minor), 0)::BIGINT AS total_minor,
            COALESCE(SUM(platform_amount_minor), 0)::BIGINT AS platform_minor,
            COALESCE(SUM(creator_amount_minor), 0)::BIGINT AS creator_minor,
            COUNT(*) AS transaction_count
        FROM transactions
        WHERE tenant_id = $1
          AND status = 'succeeded'
          AND kind IN ('payment', 'refund', 'chargeback')
          AND processed_at >= $2
          AND processed_at < $3
        "#,
    )
    .bind(tenant_id)
    .bind(start)
    .bind(end)
    .fetch_one(pool)
    .await
}
