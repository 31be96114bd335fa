//! Webhook ingestion engine
//!
//! A delivery is verified, claimed in `processed_events` with one atomic
//! upsert, dispatched to the owning component, and its outcome recorded.
//! Once the signature checks out the caller always acknowledges; failed
//! dispatches are retried by the sweeper.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use super::event::ProcessorEvent;
use super::sweeper::RetryConfig;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics::Metrics;
use crate::models::{ProcessedEvent, SubscriptionStatus, Transaction, WebhookEventStatus};
use crate::repos::event_repo;
use crate::services::account_registry::AccountRegistry;
use crate::services::subscription_ledger::{
    event_time, LifecycleOutcome, SubscriptionLedger, SubscriptionSnapshot,
};
use crate::services::transaction_ledger::{PaymentRecord, ReversalRecord, SubscriptionRef, TransactionLedger};
use crate::stripe::types::{Charge, Event, Invoice, PaymentIntent};
use crate::stripe::webhook::{verify_webhook_signature, SignatureError};

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub secret: String,
    pub tolerance_secs: i64,
    pub retry: RetryConfig,
    /// How long a claimed event is reserved for its handler
    pub lease: Duration,
}

impl WebhookSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            secret: config.stripe_webhook_secret.clone(),
            tolerance_secs: config.webhook_tolerance_secs,
            retry: RetryConfig {
                max_attempts: config.webhook_max_attempts,
                initial_backoff: config.webhook_retry_initial,
                max_backoff: config.webhook_retry_max,
            },
            lease: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Dispatched and applied
    Processed,
    /// Stored and marked processed without a side effect
    Ignored,
    /// Seen before and already processed
    AlreadyProcessed,
    /// Another handler holds the lease
    InFlight,
    /// Dispatch failed; scheduled for retry
    Failed,
    /// Dispatch failed on the last allowed attempt
    DeadLettered,
}

impl IngestOutcome {
    fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Processed => "processed",
            IngestOutcome::Ignored => "unhandled",
            IngestOutcome::AlreadyProcessed => "duplicate",
            IngestOutcome::InFlight => "in_flight",
            IngestOutcome::Failed => "failed",
            IngestOutcome::DeadLettered => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    pub event_id: String,
    pub event_type: String,
    pub outcome: IngestOutcome,
}

pub struct WebhookEngine {
    pool: PgPool,
    accounts: Arc<AccountRegistry>,
    subscriptions: Arc<SubscriptionLedger>,
    transactions: Arc<TransactionLedger>,
    metrics: Metrics,
    settings: WebhookSettings,
}

fn signature_reason(err: &SignatureError) -> &'static str {
    match err {
        SignatureError::MissingHeader => "missing",
        SignatureError::Malformed => "malformed",
        SignatureError::TimestampOutOfTolerance => "expired",
        SignatureError::Mismatch => "mismatch",
    }
}

/// A ledger duplicate means the row already exists, which is the goal
fn tolerate_duplicate(result: AppResult<Transaction>) -> AppResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_duplicate_transaction() => {
            tracing::debug!(error = %e, "Ledger row already recorded");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

impl WebhookEngine {
    pub fn new(
        pool: PgPool,
        accounts: Arc<AccountRegistry>,
        subscriptions: Arc<SubscriptionLedger>,
        transactions: Arc<TransactionLedger>,
        metrics: Metrics,
        settings: WebhookSettings,
    ) -> Self {
        Self {
            pool,
            accounts,
            subscriptions,
            transactions,
            metrics,
            settings,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Verify, deduplicate and dispatch one delivery.
    ///
    /// Errors are returned only before the event is recorded: a bad
    /// signature, an unreadable envelope, or a failed claim. Everything after
    /// the claim is reported through the outcome.
    pub async fn ingest(&self, raw_body: &[u8], signature_header: Option<&str>) -> AppResult<IngestReceipt> {
        if let Err(e) = verify_webhook_signature(
            raw_body,
            signature_header,
            &self.settings.secret,
            self.settings.tolerance_secs,
        ) {
            self.metrics
                .webhook_signature_failures_total
                .with_label_values(&[signature_reason(&e)])
                .inc();
            tracing::warn!(reason = %e, "Webhook signature verification failed");
            return Err(AppError::Signature);
        }

        let payload: JsonValue = serde_json::from_slice(raw_body)
            .map_err(|_| AppError::validation("Webhook body is not valid JSON"))?;
        let event: Event = serde_json::from_value(payload.clone())
            .map_err(|e| AppError::validation(format!("Webhook body is not an event: {}", e)))?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Webhook received"
        );

        let claimed = event_repo::claim_delivery(
            &self.pool,
            &event.id,
            &event.event_type,
            &payload,
            self.settings.lease,
        )
        .await?;

        let outcome = match claimed {
            Some(row) => self.run(&event, row.attempt_count).await,
            None => self.unclaimed_outcome(&event.id).await?,
        };

        if matches!(outcome, IngestOutcome::AlreadyProcessed | IngestOutcome::InFlight) {
            self.count(&event.event_type, outcome);
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                outcome = outcome.label(),
                "Duplicate delivery acknowledged"
            );
        }

        Ok(IngestReceipt {
            event_id: event.id,
            event_type: event.event_type,
            outcome,
        })
    }

    async fn unclaimed_outcome(&self, event_id: &str) -> AppResult<IngestOutcome> {
        let existing = event_repo::find(&self.pool, event_id).await?;
        Ok(match existing {
            Some(row) if row.processed => IngestOutcome::AlreadyProcessed,
            Some(row) if row.status == WebhookEventStatus::DeadLettered => IngestOutcome::DeadLettered,
            _ => IngestOutcome::InFlight,
        })
    }

    /// Re-dispatch a stored event on the sweeper's schedule
    pub async fn retry_stored(&self, event_id: &str) -> AppResult<IngestOutcome> {
        match event_repo::claim_stored(&self.pool, event_id, self.settings.lease, false).await? {
            Some(row) => Ok(self.run_stored(&row).await),
            None => self.unclaimed_outcome(event_id).await,
        }
    }

    /// Operator replay: re-dispatch a failed or dead-lettered event now
    pub async fn replay(&self, event_id: &str) -> AppResult<IngestReceipt> {
        let existing = event_repo::find(&self.pool, event_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Unknown event {}", event_id)))?;

        let outcome = if existing.processed {
            IngestOutcome::AlreadyProcessed
        } else {
            match event_repo::claim_stored(&self.pool, event_id, self.settings.lease, true).await? {
                Some(row) => {
                    tracing::info!(event_id = %event_id, attempt = row.attempt_count, "Replaying webhook event");
                    self.run_stored(&row).await
                }
                None => IngestOutcome::InFlight,
            }
        };

        Ok(IngestReceipt {
            event_id: existing.event_id,
            event_type: existing.event_type,
            outcome,
        })
    }

    pub async fn list_events(
        &self,
        status: Option<WebhookEventStatus>,
        limit: i64,
    ) -> AppResult<Vec<ProcessedEvent>> {
        Ok(event_repo::list(&self.pool, status, limit.clamp(1, 500)).await?)
    }

    async fn run_stored(&self, row: &ProcessedEvent) -> IngestOutcome {
        match serde_json::from_value::<Event>(row.payload.clone()) {
            Ok(event) => self.run(&event, row.attempt_count).await,
            Err(e) => {
                let error = format!("stored payload is not an event: {}", e);
                self.record_failure(&row.event_id, &row.event_type, row.attempt_count, &error)
                    .await
            }
        }
    }

    /// Dispatch a claimed event and record the result
    async fn run(&self, event: &Event, attempt: i32) -> IngestOutcome {
        match self.dispatch(event).await {
            Ok(applied) => {
                if let Err(e) = event_repo::mark_processed(&self.pool, &event.id).await {
                    // Lease expiry hands the event back to the sweeper
                    tracing::error!(
                        event_id = %event.id,
                        error = %e,
                        "Event applied but could not be marked processed"
                    );
                }
                let outcome = if applied {
                    IngestOutcome::Processed
                } else {
                    IngestOutcome::Ignored
                };
                self.count(&event.event_type, outcome);
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    attempt,
                    outcome = outcome.label(),
                    "Webhook event processed"
                );
                outcome
            }
            Err(e) => {
                self.record_failure(&event.id, &event.event_type, attempt, &e.to_string())
                    .await
            }
        }
    }

    async fn record_failure(&self, event_id: &str, event_type: &str, attempt: i32, error: &str) -> IngestOutcome {
        let retry = &self.settings.retry;
        let next_attempt_at = Utc::now()
            + chrono::Duration::from_std(retry.backoff_for(attempt))
                .unwrap_or_else(|_| chrono::Duration::hours(1));

        let status = event_repo::mark_failed(
            &self.pool,
            event_id,
            error,
            retry.max_attempts,
            next_attempt_at,
        )
        .await;

        let outcome = match status {
            Ok(WebhookEventStatus::DeadLettered) => {
                tracing::error!(
                    event_id = %event_id,
                    event_type = %event_type,
                    attempt,
                    error = %error,
                    "Webhook event dead-lettered; manual remediation required"
                );
                IngestOutcome::DeadLettered
            }
            Ok(_) => {
                tracing::warn!(
                    event_id = %event_id,
                    event_type = %event_type,
                    attempt,
                    next_attempt_at = %next_attempt_at,
                    error = %error,
                    "Webhook event processing failed; scheduled for retry"
                );
                IngestOutcome::Failed
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event_id,
                    error = %e,
                    "Could not record webhook failure"
                );
                IngestOutcome::Failed
            }
        };
        self.count(event_type, outcome);
        outcome
    }

    fn count(&self, event_type: &str, outcome: IngestOutcome) {
        self.metrics
            .webhook_events_total
            .with_label_values(&[event_type, outcome.label()])
            .inc();
    }

    /// Stale notifications are acknowledged without applying anything
    async fn apply_snapshot(&self, snapshot: &SubscriptionSnapshot) -> AppResult<bool> {
        let outcome = self.subscriptions.apply_lifecycle_event(snapshot).await?;
        Ok(!matches!(outcome, LifecycleOutcome::Stale(_)))
    }

    /// Route a typed event to its component. Returns whether anything was
    /// applied.
    async fn dispatch(&self, event: &Event) -> AppResult<bool> {
        let parsed = ProcessorEvent::from_event(event).map_err(|e| {
            AppError::Processing(format!("unreadable {} payload: {}", event.event_type, e))
        })?;

        match parsed {
            ProcessorEvent::AccountUpdated(account) => {
                match self.accounts.sync_status(&account.id).await {
                    Ok(_) => Ok(true),
                    Err(AppError::NotFound(_)) => {
                        tracing::debug!(external_account_id = %account.id, "Update for unmanaged account ignored");
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            }
            ProcessorEvent::AccountDeauthorized { account_id } => {
                self.accounts.deauthorize(&account_id).await?;
                Ok(true)
            }
            ProcessorEvent::CheckoutCompleted(session) => {
                if session.mode.as_deref() != Some("subscription") || session.subscription.is_none() {
                    return Ok(false);
                }
                self.subscriptions.apply_checkout_session(&session).await?;
                Ok(true)
            }
            ProcessorEvent::SubscriptionChanged(subscription) => {
                let snapshot = SubscriptionSnapshot::from_remote(&subscription, event_time(event.created))?;
                self.apply_snapshot(&snapshot).await
            }
            ProcessorEvent::SubscriptionDeleted(subscription) => {
                let mut snapshot = SubscriptionSnapshot::from_remote(&subscription, event_time(event.created))?;
                snapshot.state.status = SubscriptionStatus::Canceled;
                self.apply_snapshot(&snapshot).await
            }
            ProcessorEvent::PaymentSucceeded(intent) => self.record_intent_payment(&intent).await,
            ProcessorEvent::PaymentFailed(intent) => self.record_intent_failure(&intent).await,
            ProcessorEvent::InvoicePaid(invoice) => self.record_invoice_payment(&invoice).await,
            ProcessorEvent::ChargeRefunded(charge) => self.record_charge_refunds(&charge).await,
            ProcessorEvent::DisputeCreated(dispute) => {
                tolerate_duplicate(
                    self.transactions
                        .record_chargeback(&ReversalRecord {
                            external_id: dispute.id.clone(),
                            charge_id: dispute.charge.clone(),
                            payment_intent_id: dispute.payment_intent.clone(),
                            amount_minor: dispute.amount,
                            currency: dispute.currency.clone(),
                            reason: dispute.reason.clone(),
                        })
                        .await,
                )?;
                Ok(true)
            }
            ProcessorEvent::Unhandled { event_type } => {
                tracing::info!(event_id = %event.id, event_type = %event_type, "Unhandled event type stored");
                Ok(false)
            }
        }
    }

    /// One-off payments carry the tenant in metadata. Invoice-backed intents
    /// are recorded from the invoice event, which knows the subscription.
    async fn record_intent_payment(&self, intent: &PaymentIntent) -> AppResult<bool> {
        if intent.invoice.is_some() {
            return Ok(false);
        }
        let Some(tenant_id) = intent.metadata.get("tenant_id") else {
            tracing::debug!(payment_intent = %intent.id, "Payment without tenant metadata ignored");
            return Ok(false);
        };

        let record = PaymentRecord {
            tenant_id: tenant_id.clone(),
            external_charge_id: intent.latest_charge.clone().unwrap_or_else(|| intent.id.clone()),
            payment_intent_id: Some(intent.id.clone()),
            amount_minor: intent.amount_received.unwrap_or(intent.amount),
            currency: intent.currency.clone(),
            subscription: None,
            metadata: json!({ "source": "payment_intent" }),
        };
        tolerate_duplicate(self.transactions.record_payment(&record).await)?;
        Ok(true)
    }

    async fn record_intent_failure(&self, intent: &PaymentIntent) -> AppResult<bool> {
        let Some(tenant_id) = intent.metadata.get("tenant_id") else {
            tracing::debug!(payment_intent = %intent.id, "Failed payment without tenant metadata ignored");
            return Ok(false);
        };

        let reason = intent
            .last_payment_error
            .as_ref()
            .and_then(|e| e.message.clone().or_else(|| e.code.clone()))
            .unwrap_or_else(|| "payment failed".to_string());

        // Each failed attempt has its own charge; fall back to one row per intent
        let record = PaymentRecord {
            tenant_id: tenant_id.clone(),
            external_charge_id: intent
                .latest_charge
                .clone()
                .unwrap_or_else(|| format!("{}:failed", intent.id)),
            payment_intent_id: Some(intent.id.clone()),
            amount_minor: intent.amount,
            currency: intent.currency.clone(),
            subscription: None,
            metadata: json!({ "source": "payment_intent" }),
        };
        tolerate_duplicate(self.transactions.record_failed_payment(&record, &reason).await)?;
        Ok(true)
    }

    /// Subscription billing. The subscription must already be recorded so
    /// the row can reference it; if it is not, the event fails and the
    /// sweeper retries after the lifecycle event lands.
    async fn record_invoice_payment(&self, invoice: &Invoice) -> AppResult<bool> {
        if invoice.amount_paid <= 0 {
            return Ok(false);
        }

        let local = match invoice.subscription.as_deref() {
            Some(id) => self.subscriptions.find_by_external_id(id).await?,
            None => None,
        };

        let (tenant_id, subscription) = match (&local, invoice.subscription.as_deref()) {
            (Some(sub), _) => (
                sub.tenant_id.clone(),
                Some(SubscriptionRef {
                    id: sub.id,
                    kind: sub.kind,
                }),
            ),
            (None, Some(external_id)) => {
                return Err(AppError::Processing(format!(
                    "subscription {} not recorded yet",
                    external_id
                )));
            }
            (None, None) => match invoice.metadata.get("tenant_id") {
                Some(tenant_id) => (tenant_id.clone(), None),
                None => {
                    tracing::debug!(invoice_id = %invoice.id, "Invoice without tenant ignored");
                    return Ok(false);
                }
            },
        };

        let record = PaymentRecord {
            tenant_id,
            external_charge_id: invoice
                .charge
                .clone()
                .or_else(|| invoice.payment_intent.clone())
                .unwrap_or_else(|| invoice.id.clone()),
            payment_intent_id: invoice.payment_intent.clone(),
            amount_minor: invoice.amount_paid,
            currency: invoice.currency.clone(),
            subscription,
            metadata: json!({ "source": "invoice", "invoiceId": invoice.id }),
        };
        tolerate_duplicate(self.transactions.record_payment(&record).await)?;

        if let Some(sub) = local {
            self.subscriptions.mark_invoiced(sub.id, Utc::now()).await?;
        }
        Ok(true)
    }

    /// Record each refund on the charge. Without an expanded refund list the
    /// cumulative refunded amount is diffed against what is already recorded.
    async fn record_charge_refunds(&self, charge: &Charge) -> AppResult<bool> {
        let refunds = charge
            .refunds
            .as_ref()
            .map(|list| list.data.as_slice())
            .unwrap_or_default();

        if !refunds.is_empty() {
            for refund in refunds {
                if matches!(refund.status.as_deref(), Some("failed") | Some("canceled")) {
                    continue;
                }
                tolerate_duplicate(
                    self.transactions
                        .record_refund(&ReversalRecord {
                            external_id: refund.id.clone(),
                            charge_id: charge.id.clone(),
                            payment_intent_id: charge.payment_intent.clone(),
                            amount_minor: refund.amount,
                            currency: refund.currency.clone(),
                            reason: None,
                        })
                        .await,
                )?;
            }
            return Ok(true);
        }

        let already = self.transactions.refunded_total(&charge.id).await?;
        let delta = charge.amount_refunded - already;
        if delta <= 0 {
            return Ok(false);
        }

        tolerate_duplicate(
            self.transactions
                .record_refund(&ReversalRecord {
                    external_id: format!("{}:refunded:{}", charge.id, charge.amount_refunded),
                    charge_id: charge.id.clone(),
                    payment_intent_id: charge.payment_intent.clone(),
                    amount_minor: delta,
                    currency: charge.currency.clone(),
                    reason: None,
                })
                .await,
        )?;
        Ok(true)
    }
}
