use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::error::{AppError, AppResult, ConflictKind};
use crate::metrics::Metrics;
use crate::models::{SubscriptionKind, Transaction, TransactionKind, TransactionStatus};
use crate::repos::transaction_repo::{self, NewTransaction};
use crate::services::revenue_split::{self, compute_split, reversal_split, ReversalBasis, SplitPolicy};

/// Subscription a ledger row is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionRef {
    pub id: Uuid,
    pub kind: SubscriptionKind,
}

#[derive(Debug, Clone)]
pub struct PaymentRecord {
    pub tenant_id: String,
    /// Charge id when known, else the payment intent id
    pub external_charge_id: String,
    pub payment_intent_id: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    pub subscription: Option<SubscriptionRef>,
    pub metadata: JsonValue,
}

/// A refund or dispute against an earlier payment
#[derive(Debug, Clone)]
pub struct ReversalRecord {
    pub external_id: String,
    pub charge_id: String,
    pub payment_intent_id: Option<String>,
    /// Positive magnitude; stored negated
    pub amount_minor: i64,
    pub currency: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenueSummary {
    pub tenant_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_revenue: i64,
    pub platform_revenue: i64,
    pub creator_revenue: i64,
    pub transaction_count: i64,
}

/// Append-only ledger of money movement
pub struct TransactionLedger {
    pool: PgPool,
    metrics: Metrics,
    default_platform_percentage: i32,
}

impl TransactionLedger {
    pub fn new(pool: PgPool, metrics: Metrics, default_platform_percentage: i32) -> Self {
        Self {
            pool,
            metrics,
            default_platform_percentage,
        }
    }

    /// Split applied to a new payment. Rent goes entirely to the platform.
    async fn policy_for(&self, tenant_id: &str, subscription: Option<SubscriptionRef>) -> AppResult<SplitPolicy> {
        match subscription.map(|s| s.kind) {
            Some(SubscriptionKind::Platform) => Ok(SplitPolicy::platform_only()),
            _ => {
                revenue_split::active_policy(&self.pool, tenant_id, self.default_platform_percentage)
                    .await
            }
        }
    }

    /// Insert the row and commit. A duplicate rolls the transaction back.
    async fn append(
        &self,
        mut tx: sqlx::Transaction<'static, Postgres>,
        txn: NewTransaction,
    ) -> AppResult<Transaction> {
        let kind_label = match txn.kind {
            TransactionKind::Payment => "payment",
            TransactionKind::Refund => "refund",
            TransactionKind::Chargeback => "chargeback",
            TransactionKind::Split => "split",
        };

        match transaction_repo::insert(&mut tx, &txn).await? {
            Some(row) => {
                tx.commit().await?;
                self.metrics
                    .ledger_transactions_total
                    .with_label_values(&[kind_label, "recorded"])
                    .inc();
                tracing::info!(
                    tenant_id = %row.tenant_id,
                    kind = kind_label,
                    external_id = %row.external_id,
                    amount = row.amount_minor,
                    platform_amount = row.platform_amount_minor,
                    creator_amount = row.creator_amount_minor,
                    status = ?row.status,
                    "Transaction recorded"
                );
                Ok(row)
            }
            None => {
                self.metrics
                    .ledger_transactions_total
                    .with_label_values(&[kind_label, "duplicate"])
                    .inc();
                Err(AppError::Conflict(ConflictKind::DuplicateTransaction(
                    txn.external_id,
                )))
            }
        }
    }

    /// Record a succeeded payment with the split in force right now. The
    /// percentage is stored on the row so later policy changes never touch it.
    pub async fn record_payment(&self, payment: &PaymentRecord) -> AppResult<Transaction> {
        if payment.amount_minor < 0 {
            return Err(AppError::validation("payment amount must not be negative"));
        }

        let policy = self.policy_for(&payment.tenant_id, payment.subscription).await?;
        let split = compute_split(payment.amount_minor, policy);
        let tx = self.pool.begin().await?;

        self.append(tx, NewTransaction {
            tenant_id: payment.tenant_id.clone(),
            external_id: payment.external_charge_id.clone(),
            external_charge_id: Some(payment.external_charge_id.clone()),
            external_payment_intent_id: payment.payment_intent_id.clone(),
            subscription_id: payment.subscription.map(|s| s.id),
            subscription_kind: payment.subscription.map(|s| s.kind),
            kind: TransactionKind::Payment,
            amount_minor: payment.amount_minor,
            currency: payment.currency.to_lowercase(),
            platform_amount_minor: split.platform_amount,
            creator_amount_minor: split.creator_amount,
            platform_percentage: policy.platform_percentage(),
            status: TransactionStatus::Succeeded,
            failure_reason: None,
            metadata: payment.metadata.clone(),
        })
        .await
    }

    /// Record a failed payment attempt. Kept for audit, excluded from revenue.
    pub async fn record_failed_payment(
        &self,
        payment: &PaymentRecord,
        failure_reason: &str,
    ) -> AppResult<Transaction> {
        let policy = self.policy_for(&payment.tenant_id, payment.subscription).await?;
        let split = compute_split(payment.amount_minor, policy);
        let tx = self.pool.begin().await?;

        self.append(tx, NewTransaction {
            tenant_id: payment.tenant_id.clone(),
            external_id: payment.external_charge_id.clone(),
            external_charge_id: None,
            external_payment_intent_id: payment.payment_intent_id.clone(),
            subscription_id: payment.subscription.map(|s| s.id),
            subscription_kind: payment.subscription.map(|s| s.kind),
            kind: TransactionKind::Payment,
            amount_minor: payment.amount_minor,
            currency: payment.currency.to_lowercase(),
            platform_amount_minor: split.platform_amount,
            creator_amount_minor: split.creator_amount,
            platform_percentage: policy.platform_percentage(),
            status: TransactionStatus::Failed,
            failure_reason: Some(failure_reason.to_string()),
            metadata: payment.metadata.clone(),
        })
        .await
    }

    pub async fn record_refund(&self, refund: &ReversalRecord) -> AppResult<Transaction> {
        self.record_reversal(TransactionKind::Refund, refund).await
    }

    pub async fn record_chargeback(&self, dispute: &ReversalRecord) -> AppResult<Transaction> {
        self.record_reversal(TransactionKind::Chargeback, dispute).await
    }

    /// Append a negative row against the original payment. The platform share
    /// is pro-rated from the original row, so partial reversals that add up to
    /// the payment return exactly its recorded shares. A missing original
    /// fails so the event is retried once the payment has been recorded.
    async fn record_reversal(&self, kind: TransactionKind, reversal: &ReversalRecord) -> AppResult<Transaction> {
        if reversal.amount_minor <= 0 {
            return Err(AppError::validation("reversal amount must be positive"));
        }

        let mut tx = self.pool.begin().await?;
        let original = transaction_repo::lock_original_payment(
            &mut tx,
            &reversal.charge_id,
            reversal.payment_intent_id.as_deref(),
        )
        .await?
        .ok_or_else(|| {
            AppError::Processing(format!(
                "no recorded payment for charge {}",
                reversal.charge_id
            ))
        })?;

        let policy = SplitPolicy::new(original.platform_percentage)?;
        let reversed = transaction_repo::reversed_totals(&mut tx, original.id).await?;
        let basis = ReversalBasis {
            original_amount: original.amount_minor,
            original_platform_amount: original.platform_amount_minor,
            reversed_amount: reversed.amount_minor,
            reversed_platform_amount: reversed.platform_minor,
        };
        let split = reversal_split(basis, reversal.amount_minor, policy);
        let amount = -reversal.amount_minor;

        let mut metadata = serde_json::json!({ "originalTransactionId": original.id });
        if let Some(reason) = &reversal.reason {
            metadata["reason"] = JsonValue::String(reason.clone());
        }

        self.append(tx, NewTransaction {
            tenant_id: original.tenant_id.clone(),
            external_id: reversal.external_id.clone(),
            external_charge_id: Some(reversal.charge_id.clone()),
            external_payment_intent_id: original.external_payment_intent_id.clone(),
            subscription_id: original.subscription_id,
            subscription_kind: original.subscription_kind,
            kind,
            amount_minor: amount,
            currency: reversal.currency.to_lowercase(),
            platform_amount_minor: split.platform_amount,
            creator_amount_minor: split.creator_amount,
            platform_percentage: policy.platform_percentage(),
            status: TransactionStatus::Succeeded,
            failure_reason: None,
            metadata,
        })
        .await
    }

    /// Magnitude of refunds already recorded against a charge
    pub async fn refunded_total(&self, charge_id: &str) -> AppResult<i64> {
        Ok(transaction_repo::refunded_total_for_charge(&self.pool, charge_id).await?)
    }

    /// Net revenue in `[start, end)`: succeeded payments minus refunds and
    /// chargebacks. Amounts assume the tenant bills in a single currency.
    pub async fn revenue_for_period(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<RevenueSummary> {
        if start >= end {
            return Err(AppError::validation("start must be before end"));
        }

        let totals = transaction_repo::period_totals(&self.pool, tenant_id, start, end).await?;

        Ok(RevenueSummary {
            tenant_id: tenant_id.to_string(),
            start,
            end,
            total_revenue: totals.total_minor,
            platform_revenue: totals.platform_minor,
            creator_revenue: totals.creator_minor,
            transaction_count: totals.transaction_count,
        })
    }

    pub async fn list_for_tenant(&self, tenant_id: &str) -> AppResult<Vec<Transaction>> {
        Ok(transaction_repo::list_for_tenant(&self.pool, tenant_id).await?)
    }
}
