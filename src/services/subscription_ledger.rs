//! Subscription ledger
//!
//! Both subscription kinds follow one lifecycle graph. Every local change of
//! subscription state goes through [`SubscriptionLedger::apply_lifecycle_event`],
//! whether it was triggered by a webhook, checkout confirmation, or a cancel
//! request, so there is a single writer path.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, AppResult, ConflictKind};
use crate::metrics::Metrics;
use crate::models::{BillingInterval, Subscription, SubscriptionKind, SubscriptionStatus};
use crate::processor::{idempotency_key, CheckoutParams, PaymentProcessor};
use crate::repos::subscription_repo::{self, NewSubscription, SubscriptionState};
use crate::repos::{account_repo, plan_repo};
use crate::services::revenue_split;
use crate::stripe::types::{self as remote, Metadata};

/// Optimistic update retries before giving up to the sweeper
const MAX_VERSION_RETRIES: usize = 5;

/// Whether `from -> to` is an edge of the lifecycle graph. Same-status
/// updates are handled by the caller as idempotent refreshes.
pub fn is_allowed_transition(from: SubscriptionStatus, to: SubscriptionStatus) -> bool {
    use SubscriptionStatus::*;
    matches!(
        (from, to),
        (Incomplete, Active)
            | (Incomplete, IncompleteExpired)
            | (Trialing, Active)
            | (Trialing, PastDue)
            | (Trialing, Canceled)
            | (Active, PastDue)
            | (Active, Canceled)
            | (PastDue, Active)
            | (PastDue, Unpaid)
            | (PastDue, Canceled)
    )
}

/// Local parties a processor subscription belongs to, read from the
/// metadata stamped at checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionParties {
    pub kind: SubscriptionKind,
    pub tenant_id: String,
    pub payer_id: String,
    pub plan_id: String,
}

impl SubscriptionParties {
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let field = |key: &str| metadata.get(key).filter(|v| !v.is_empty()).cloned();
        Some(Self {
            kind: SubscriptionKind::parse(metadata.get("kind")?)?,
            tenant_id: field("tenant_id")?,
            payer_id: field("payer_id")?,
            plan_id: field("plan_id")?,
        })
    }
}

/// Processor subscription normalized into local types
#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    pub external_subscription_id: String,
    pub external_customer_id: String,
    pub parties: Option<SubscriptionParties>,
    pub state: SubscriptionState,
    /// Processor time the state was observed at. Older observations than
    /// the newest one applied are skipped.
    pub observed_at: Option<DateTime<Utc>>,
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| Utc.timestamp_opt(s, 0).single())
}

/// Observation time of a webhook event; `created` is unset on some fixtures
pub fn event_time(created: i64) -> Option<DateTime<Utc>> {
    timestamp(Some(created).filter(|c| *c > 0))
}

/// Observation time of a synchronous retrieval, at the processor's
/// whole-second resolution so events from the same second still apply
pub fn retrieved_now() -> Option<DateTime<Utc>> {
    timestamp(Some(Utc::now().timestamp()))
}

impl SubscriptionSnapshot {
    pub fn from_remote(sub: &remote::Subscription, observed_at: Option<DateTime<Utc>>) -> AppResult<Self> {
        let status = SubscriptionStatus::parse(&sub.status).ok_or_else(|| {
            AppError::Processing(format!(
                "subscription {} has unsupported status {}",
                sub.id, sub.status
            ))
        })?;

        let price = sub.first_item().map(|item| &item.price).ok_or_else(|| {
            AppError::Processing(format!("subscription {} has no items", sub.id))
        })?;
        let interval = price
            .recurring
            .as_ref()
            .and_then(|r| BillingInterval::parse(&r.interval))
            .ok_or_else(|| {
                AppError::Processing(format!(
                    "subscription {} has an unsupported billing interval",
                    sub.id
                ))
            })?;

        let (period_start, period_end) = sub.period();

        Ok(Self {
            external_subscription_id: sub.id.clone(),
            external_customer_id: sub.customer.clone(),
            parties: SubscriptionParties::from_metadata(&sub.metadata),
            state: SubscriptionState {
                status,
                current_period_start: timestamp(period_start),
                current_period_end: timestamp(period_end),
                trial_start: timestamp(sub.trial_start),
                trial_end: timestamp(sub.trial_end),
                cancel_at_period_end: sub.cancel_at_period_end,
                canceled_at: timestamp(sub.canceled_at),
                amount_minor: price.unit_amount.unwrap_or(0),
                currency: price.currency.to_lowercase(),
                billing_interval: interval,
            },
            observed_at,
        })
    }
}

#[derive(Debug, Clone)]
pub enum LifecycleOutcome {
    Created(Subscription),
    Updated(Subscription),
    /// Older than the newest notification already applied; nothing changed
    Stale(Subscription),
    /// Transition outside the graph; the row is left unchanged
    Rejected {
        current: Subscription,
        attempted: SubscriptionStatus,
    },
}

impl LifecycleOutcome {
    pub fn subscription(&self) -> &Subscription {
        match self {
            LifecycleOutcome::Created(s) | LifecycleOutcome::Updated(s) | LifecycleOutcome::Stale(s) => s,
            LifecycleOutcome::Rejected { current, .. } => current,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub kind: SubscriptionKind,
    pub tenant_id: String,
    pub payer_id: String,
    pub plan_id: String,
    pub trial_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRef {
    pub session_id: String,
    pub url: Option<String>,
}

pub struct SubscriptionLedger {
    pool: PgPool,
    processor: Arc<dyn PaymentProcessor>,
    metrics: Metrics,
    default_platform_percentage: i32,
    success_url: String,
    cancel_url: String,
}

impl SubscriptionLedger {
    pub fn new(
        pool: PgPool,
        processor: Arc<dyn PaymentProcessor>,
        metrics: Metrics,
        default_platform_percentage: i32,
        success_url: String,
        cancel_url: String,
    ) -> Self {
        Self {
            pool,
            processor,
            metrics,
            default_platform_percentage,
            success_url,
            cancel_url,
        }
    }

    /// Open a hosted checkout for a plan. No local row is written; the
    /// subscription is recorded once the processor reports it.
    pub async fn create_checkout(&self, req: &CheckoutRequest) -> AppResult<CheckoutRef> {
        for (name, value) in [
            ("tenantId", &req.tenant_id),
            ("payerId", &req.payer_id),
            ("planId", &req.plan_id),
        ] {
            if value.trim().is_empty() {
                return Err(AppError::validation(format!("{} is required", name)));
            }
        }

        let (destination_account, application_fee_percent) = match req.kind {
            SubscriptionKind::Member => {
                let account = account_repo::find_by_tenant(&self.pool, &req.tenant_id).await?;
                let account = match account {
                    Some(a) if a.can_accept_charges() => a,
                    _ => {
                        return Err(AppError::Conflict(ConflictKind::AccountNotChargeable(
                            req.tenant_id.clone(),
                        )))
                    }
                };
                let policy = revenue_split::active_policy(
                    &self.pool,
                    &req.tenant_id,
                    self.default_platform_percentage,
                )
                .await?;
                (
                    Some(account.external_account_id),
                    Some(policy.platform_percentage()),
                )
            }
            SubscriptionKind::Platform => (None, None),
        };

        if subscription_repo::find_live_for_payer(&self.pool, &req.tenant_id, &req.payer_id, req.kind)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(ConflictKind::DuplicateActiveSubscription {
                tenant_id: req.tenant_id.clone(),
                payer_id: req.payer_id.clone(),
            }));
        }

        let plan_scope = match req.kind {
            SubscriptionKind::Member => Some(req.tenant_id.as_str()),
            SubscriptionKind::Platform => None,
        };
        let plan = plan_repo::find_active(&self.pool, req.kind, plan_scope, &req.plan_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Unknown plan {}", req.plan_id)))?;

        let params = CheckoutParams {
            kind: req.kind,
            tenant_id: req.tenant_id.clone(),
            payer_id: req.payer_id.clone(),
            plan_id: plan.plan_id.clone(),
            price_id: plan.external_price_id.clone(),
            trial_days: req.trial_days,
            success_url: self.success_url.clone(),
            cancel_url: self.cancel_url.clone(),
            destination_account,
            application_fee_percent,
        };

        // Same request on the same day reuses the same session
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let trial = req.trial_days.unwrap_or(0).to_string();
        let key = idempotency_key(
            "create_checkout",
            &[req.kind.as_str(), &req.tenant_id, &req.payer_id, &plan.plan_id, &trial, &day],
        );

        let result = self.processor.create_checkout_session(&params, &key).await;
        self.metrics.record_processor_call("create_checkout_session", &result);
        let session = result?;

        tracing::info!(
            kind = req.kind.as_str(),
            tenant_id = %req.tenant_id,
            payer_id = %req.payer_id,
            plan_id = %plan.plan_id,
            session_id = %session.id,
            "Checkout session created"
        );

        Ok(CheckoutRef {
            session_id: session.id,
            url: session.url,
        })
    }

    /// Record the subscription behind a completed checkout session.
    /// The `checkout.session.completed` webhook runs the same path.
    pub async fn confirm_checkout(&self, session_id: &str) -> AppResult<Subscription> {
        if session_id.trim().is_empty() {
            return Err(AppError::validation("sessionId is required"));
        }

        let result = self.processor.retrieve_checkout_session(session_id).await;
        self.metrics.record_processor_call("retrieve_checkout_session", &result);
        let session = result?;

        self.apply_checkout_session(&session).await
    }

    pub async fn apply_checkout_session(&self, session: &remote::CheckoutSession) -> AppResult<Subscription> {
        let subscription_id = session.subscription.as_deref().ok_or_else(|| {
            AppError::validation(format!("Checkout session {} is not complete", session.id))
        })?;

        let result = self.processor.retrieve_subscription(subscription_id).await;
        self.metrics.record_processor_call("retrieve_subscription", &result);
        let remote_sub = result?;

        let mut snapshot = SubscriptionSnapshot::from_remote(&remote_sub, retrieved_now())?;
        if snapshot.parties.is_none() {
            snapshot.parties = SubscriptionParties::from_metadata(&session.metadata);
        }

        let outcome = self.apply_lifecycle_event(&snapshot).await?;
        Ok(outcome.subscription().clone())
    }

    /// Bring the local row in line with the processor's subscription.
    ///
    /// Creates the row when this is the first notice of the subscription.
    /// A snapshot observed before the newest one already applied is skipped
    /// as `Stale`. Otherwise the change applies only along the lifecycle
    /// graph; a transition outside it is stored as an anomaly and reported
    /// as `Rejected` without failing, so out-of-order deliveries settle.
    pub async fn apply_lifecycle_event(&self, snapshot: &SubscriptionSnapshot) -> AppResult<LifecycleOutcome> {
        let external_id = &snapshot.external_subscription_id;

        for _ in 0..MAX_VERSION_RETRIES {
            let current = subscription_repo::find_by_external_id(&self.pool, external_id).await?;

            let Some(current) = current else {
                let parties = snapshot.parties.as_ref().ok_or_else(|| {
                    AppError::Processing(format!(
                        "subscription {} carries no tenant metadata",
                        external_id
                    ))
                })?;

                let new_subscription = NewSubscription {
                    kind: parties.kind,
                    tenant_id: parties.tenant_id.clone(),
                    payer_id: parties.payer_id.clone(),
                    plan_id: parties.plan_id.clone(),
                    external_subscription_id: external_id.clone(),
                    external_customer_id: snapshot.external_customer_id.clone(),
                    state: snapshot.state.clone(),
                    last_event_at: snapshot.observed_at,
                };

                match subscription_repo::insert_if_absent(&self.pool, &new_subscription).await? {
                    Some(created) => {
                        tracing::info!(
                            external_subscription_id = %external_id,
                            tenant_id = %created.tenant_id,
                            status = %created.status,
                            "Subscription recorded"
                        );
                        return Ok(LifecycleOutcome::Created(created));
                    }
                    // Lost the insert race; re-read and apply as an update
                    None => continue,
                }
            };

            if let (Some(observed), Some(last)) = (snapshot.observed_at, current.last_event_at) {
                if observed < last {
                    tracing::info!(
                        external_subscription_id = %external_id,
                        observed_at = %observed,
                        last_event_at = %last,
                        "Stale subscription notification skipped"
                    );
                    return Ok(LifecycleOutcome::Stale(current));
                }
            }

            let to = snapshot.state.status;
            if current.status != to && !is_allowed_transition(current.status, to) {
                return self.reject_transition(current, to).await;
            }

            match subscription_repo::update_state(
                &self.pool,
                current.id,
                current.version,
                &snapshot.state,
                snapshot.observed_at,
            )
            .await?
            {
                Some(updated) => {
                    if current.status != updated.status {
                        tracing::info!(
                            external_subscription_id = %external_id,
                            from = %current.status,
                            to = %updated.status,
                            "Subscription status changed"
                        );
                    }
                    return Ok(LifecycleOutcome::Updated(updated));
                }
                None => {
                    tracing::debug!(
                        external_subscription_id = %external_id,
                        "Subscription changed concurrently; retrying"
                    );
                }
            }
        }

        Err(AppError::Processing(format!(
            "subscription {} kept changing concurrently",
            external_id
        )))
    }

    async fn reject_transition(
        &self,
        current: Subscription,
        attempted: SubscriptionStatus,
    ) -> AppResult<LifecycleOutcome> {
        let reason = if current.status.is_terminal() {
            format!("{} is terminal", current.status)
        } else {
            format!("{} -> {} is not a lifecycle transition", current.status, attempted)
        };

        tracing::warn!(
            external_subscription_id = %current.external_subscription_id,
            from = %current.status,
            to = %attempted,
            reason = %reason,
            "Subscription transition rejected; flagged for review"
        );
        self.metrics
            .subscription_transitions_rejected_total
            .with_label_values(&[current.status.as_str(), attempted.as_str()])
            .inc();

        subscription_repo::insert_anomaly(
            &self.pool,
            &current.external_subscription_id,
            current.status,
            attempted,
            &reason,
        )
        .await?;

        Ok(LifecycleOutcome::Rejected { current, attempted })
    }

    /// Cancel at the processor, then apply the confirmed remote state through
    /// the lifecycle writer. Nothing is written locally if the processor call
    /// fails.
    pub async fn cancel(&self, subscription_id: Uuid, at_period_end: bool) -> AppResult<Subscription> {
        let subscription = subscription_repo::find_by_id(&self.pool, subscription_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Unknown subscription {}", subscription_id)))?;

        if subscription.status.is_terminal() {
            return Ok(subscription);
        }

        let mode = if at_period_end { "period_end" } else { "immediate" };
        let key = idempotency_key(
            "cancel_subscription",
            &[&subscription.external_subscription_id, mode],
        );
        let result = self
            .processor
            .cancel_subscription(&subscription.external_subscription_id, at_period_end, &key)
            .await;
        self.metrics.record_processor_call("cancel_subscription", &result);
        let remote_sub = result?;

        tracing::info!(
            external_subscription_id = %subscription.external_subscription_id,
            at_period_end,
            "Cancellation confirmed by processor"
        );

        let snapshot = SubscriptionSnapshot::from_remote(&remote_sub, retrieved_now())?;
        let outcome = self.apply_lifecycle_event(&snapshot).await?;
        Ok(outcome.subscription().clone())
    }

    pub async fn find_by_external_id(&self, external_subscription_id: &str) -> AppResult<Option<Subscription>> {
        Ok(subscription_repo::find_by_external_id(&self.pool, external_subscription_id).await?)
    }

    /// Freeze amount and currency once a period has been billed
    pub async fn mark_invoiced(&self, subscription_id: Uuid, invoiced_at: DateTime<Utc>) -> AppResult<()> {
        Ok(subscription_repo::mark_invoiced(&self.pool, subscription_id, invoiced_at).await?)
    }

    pub async fn get_member_subscription(&self, tenant_id: &str, user_id: &str) -> AppResult<Subscription> {
        subscription_repo::find_current_for_payer(&self.pool, tenant_id, user_id, SubscriptionKind::Member)
            .await?
            .ok_or_else(|| {
                AppError::not_found(format!(
                    "No subscription for user {} on tenant {}",
                    user_id, tenant_id
                ))
            })
    }

    pub async fn list_member_subscriptions(&self, tenant_id: &str) -> AppResult<Vec<Subscription>> {
        Ok(subscription_repo::list_for_tenant(&self.pool, tenant_id, SubscriptionKind::Member).await?)
    }

    pub async fn get_platform_subscription(&self, tenant_id: &str) -> AppResult<Subscription> {
        subscription_repo::find_current_for_payer(&self.pool, tenant_id, tenant_id, SubscriptionKind::Platform)
            .await?
            .ok_or_else(|| {
                AppError::not_found(format!("No platform subscription for tenant {}", tenant_id))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stripe::types::{ListResponse, Price, Recurring, SubscriptionItem};
    use SubscriptionStatus::*;

    const ALL: [SubscriptionStatus; 7] = [
        Incomplete,
        IncompleteExpired,
        Trialing,
        Active,
        PastDue,
        Canceled,
        Unpaid,
    ];

    #[test]
    fn test_terminal_states_have_no_exits() {
        for to in ALL {
            assert!(!is_allowed_transition(Canceled, to));
            assert!(!is_allowed_transition(IncompleteExpired, to));
        }
    }

    #[test]
    fn test_lifecycle_edges() {
        assert!(is_allowed_transition(Incomplete, Active));
        assert!(is_allowed_transition(Incomplete, IncompleteExpired));
        assert!(is_allowed_transition(Trialing, Active));
        assert!(is_allowed_transition(Trialing, PastDue));
        assert!(is_allowed_transition(Active, PastDue));
        assert!(is_allowed_transition(PastDue, Active));
        assert!(is_allowed_transition(PastDue, Unpaid));
        for from in [Active, PastDue, Trialing] {
            assert!(is_allowed_transition(from, Canceled));
        }
    }

    #[test]
    fn test_edges_outside_graph_rejected() {
        assert!(!is_allowed_transition(Active, Trialing));
        assert!(!is_allowed_transition(Active, Incomplete));
        assert!(!is_allowed_transition(Incomplete, Canceled));
        assert!(!is_allowed_transition(Unpaid, Active));
        assert!(!is_allowed_transition(Canceled, Active));
    }

    fn remote_subscription(status: &str) -> remote::Subscription {
        remote::Subscription {
            id: "sub_1".to_string(),
            customer: "cus_1".to_string(),
            status: status.to_string(),
            current_period_start: None,
            current_period_end: None,
            trial_start: None,
            trial_end: None,
            cancel_at_period_end: false,
            canceled_at: None,
            metadata: [
                ("kind".to_string(), "member".to_string()),
                ("tenant_id".to_string(), "t1".to_string()),
                ("payer_id".to_string(), "u1".to_string()),
                ("plan_id".to_string(), "gold".to_string()),
            ]
            .into_iter()
            .collect(),
            items: ListResponse {
                data: vec![SubscriptionItem {
                    id: "si_1".to_string(),
                    price: Price {
                        id: "price_1".to_string(),
                        unit_amount: Some(1500),
                        currency: "USD".to_string(),
                        recurring: Some(Recurring {
                            interval: "month".to_string(),
                        }),
                    },
                    current_period_start: Some(1_700_000_000),
                    current_period_end: Some(1_702_592_000),
                }],
                has_more: false,
            },
        }
    }

    #[test]
    fn test_snapshot_from_remote() {
        let snapshot = SubscriptionSnapshot::from_remote(&remote_subscription("past_due"), event_time(1_700_000_100)).unwrap();
        assert_eq!(snapshot.state.status, PastDue);
        assert_eq!(snapshot.state.amount_minor, 1500);
        assert_eq!(snapshot.state.currency, "usd");
        assert_eq!(snapshot.state.billing_interval, BillingInterval::Month);
        assert_eq!(
            snapshot.state.current_period_start.map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
        assert_eq!(snapshot.observed_at.map(|t| t.timestamp()), Some(1_700_000_100));
        let parties = snapshot.parties.unwrap();
        assert_eq!(parties.kind, SubscriptionKind::Member);
        assert_eq!(parties.payer_id, "u1");
    }

    #[test]
    fn test_snapshot_rejects_unknown_status() {
        let err = SubscriptionSnapshot::from_remote(&remote_subscription("paused"), None).unwrap_err();
        assert!(matches!(err, AppError::Processing(_)));
    }

    #[test]
    fn test_event_time_ignores_unset_created() {
        assert_eq!(event_time(0), None);
        assert_eq!(event_time(-5), None);
        assert_eq!(event_time(1_700_000_000).map(|t| t.timestamp()), Some(1_700_000_000));
        assert_eq!(retrieved_now().map(|t| t.timestamp_subsec_nanos()), Some(0));
    }

    #[test]
    fn test_parties_require_all_fields() {
        let mut metadata = remote_subscription("active").metadata;
        metadata.remove("payer_id");
        assert!(SubscriptionParties::from_metadata(&metadata).is_none());
    }
}
