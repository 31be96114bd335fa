use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{CheckoutParams, CreateAccountParams, PaymentProcessor, ProcessorError};
use crate::models::AccountType;
use crate::stripe::types::{
    Account, AccountLink, CheckoutSession, ListResponse, Price, Recurring, Requirements,
    Subscription, SubscriptionItem,
};

/// In-memory payment processor for development and testing
///
/// Mirrors the processor contract closely enough for the reconciliation
/// paths: idempotency keys replay the first result, unknown ids return 404,
/// and individual operations can be forced to fail.
#[derive(Default)]
pub struct MockProcessor {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    counter: u64,
    accounts: HashMap<String, Account>,
    sessions: HashMap<String, CheckoutSession>,
    session_prices: HashMap<String, String>,
    subscriptions: HashMap<String, Subscription>,
    prices: HashMap<String, (i64, String, String)>,
    replays: HashMap<String, String>,
    calls: HashMap<&'static str, usize>,
    /// Operation -> HTTP status it fails with
    failing: HashMap<&'static str, u16>,
}

impl MockState {
    /// Ids are unique across instances so rows written by separate test
    /// runs never collide
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        format!("{}_mock_{}{}", prefix, &nonce[..12], self.counter)
    }

    fn enter(&mut self, operation: &'static str) -> Result<(), ProcessorError> {
        *self.calls.entry(operation).or_insert(0) += 1;
        if let Some(&status_code) = self.failing.get(operation) {
            tracing::warn!(operation, status_code, "Mock processor failing operation on request");
            return Err(ProcessorError::ApiError {
                status_code,
                message: format!("{} failed", operation),
            });
        }
        Ok(())
    }
}

fn not_found(kind: &str, id: &str) -> ProcessorError {
    ProcessorError::ApiError {
        status_code: 404,
        message: format!("resource_missing: No such {}: '{}'", kind, id),
    }
}

impl MockProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of times an operation was invoked (including failed calls)
    pub fn call_count(&self, operation: &str) -> usize {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// Make every subsequent call of `operation` fail with a 503
    pub fn fail_operation(&self, operation: &'static str) {
        self.fail_operation_with(operation, 503);
    }

    /// Make every subsequent call of `operation` fail with `status_code`
    pub fn fail_operation_with(&self, operation: &'static str, status_code: u16) {
        self.lock().failing.insert(operation, status_code);
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Register the amount, currency and interval behind a price id.
    /// Unregistered prices complete as 1000 usd per month.
    pub fn register_price(&self, price_id: &str, unit_amount: i64, currency: &str, interval: &str) {
        self.lock().prices.insert(
            price_id.to_string(),
            (unit_amount, currency.to_string(), interval.to_string()),
        );
    }

    /// Simulate the tenant finishing hosted onboarding
    pub fn set_account_capabilities(
        &self,
        account_id: &str,
        charges_enabled: bool,
        payouts_enabled: bool,
        currently_due: Vec<String>,
    ) -> Option<Account> {
        let mut state = self.lock();
        let account = state.accounts.get_mut(account_id)?;
        account.charges_enabled = charges_enabled;
        account.payouts_enabled = payouts_enabled;
        account.details_submitted = charges_enabled || payouts_enabled;
        account.requirements = Some(Requirements {
            currently_due,
            ..Requirements::default()
        });
        Some(account.clone())
    }

    /// Move a remote subscription to a new status, as the processor would
    /// during billing
    pub fn set_subscription_status(&self, subscription_id: &str, status: &str) -> Option<Subscription> {
        let mut state = self.lock();
        let subscription = state.subscriptions.get_mut(subscription_id)?;
        subscription.status = status.to_string();
        Some(subscription.clone())
    }

    /// Simulate the payer completing a checkout session. Creates the remote
    /// subscription carrying the session metadata and returns it.
    pub fn complete_checkout(&self, session_id: &str, status: &str) -> Option<Subscription> {
        let mut state = self.lock();
        let session = state.sessions.get(session_id)?.clone();
        if let Some(existing) = session
            .subscription
            .as_ref()
            .and_then(|id| state.subscriptions.get(id))
        {
            return Some(existing.clone());
        }

        let price_id = state.session_prices.get(session_id).cloned().unwrap_or_default();
        let (unit_amount, currency, interval) = state
            .prices
            .get(&price_id)
            .cloned()
            .unwrap_or_else(|| (1000, "usd".to_string(), "month".to_string()));

        let now = chrono::Utc::now().timestamp();
        let period_days = if interval == "year" { 365 } else { 30 };
        let period_end = now + period_days * 86_400;
        let subscription_id = state.next_id("sub");
        let customer_id = state.next_id("cus");
        let item_id = state.next_id("si");

        let subscription = Subscription {
            id: subscription_id.clone(),
            customer: customer_id.clone(),
            status: status.to_string(),
            current_period_start: Some(now),
            current_period_end: Some(period_end),
            trial_start: (status == "trialing").then_some(now),
            trial_end: (status == "trialing").then_some(period_end),
            cancel_at_period_end: false,
            canceled_at: None,
            metadata: session.metadata.clone(),
            items: ListResponse {
                data: vec![SubscriptionItem {
                    id: item_id,
                    price: Price {
                        id: price_id,
                        unit_amount: Some(unit_amount),
                        currency,
                        recurring: Some(Recurring { interval }),
                    },
                    current_period_start: Some(now),
                    current_period_end: Some(period_end),
                }],
                has_more: false,
            },
        };

        state
            .subscriptions
            .insert(subscription_id.clone(), subscription.clone());
        if let Some(stored) = state.sessions.get_mut(session_id) {
            stored.status = Some("complete".to_string());
            stored.subscription = Some(subscription_id);
            stored.customer = Some(customer_id);
        }

        Some(subscription)
    }
}

#[async_trait]
impl PaymentProcessor for MockProcessor {
    async fn create_account(
        &self,
        params: &CreateAccountParams,
        idempotency_key: &str,
    ) -> Result<Account, ProcessorError> {
        let mut state = self.lock();
        state.enter("create_account")?;

        if let Some(id) = state.replays.get(idempotency_key).cloned() {
            return state
                .accounts
                .get(&id)
                .cloned()
                .ok_or_else(|| not_found("account", &id));
        }

        let id = state.next_id("acct");
        let account = Account {
            id: id.clone(),
            account_type: Some(
                match params.account_type {
                    AccountType::Standard => "standard",
                    AccountType::Express => "express",
                    AccountType::Custom => "custom",
                }
                .to_string(),
            ),
            country: Some(params.country.clone()),
            email: params.email.clone(),
            charges_enabled: false,
            payouts_enabled: false,
            details_submitted: false,
            requirements: Some(Requirements {
                currently_due: vec!["external_account".to_string(), "tos_acceptance.date".to_string()],
                ..Requirements::default()
            }),
            capabilities: None,
            metadata: [("tenant_id".to_string(), params.tenant_id.clone())]
                .into_iter()
                .collect(),
        };

        state.accounts.insert(id.clone(), account.clone());
        state.replays.insert(idempotency_key.to_string(), id);
        Ok(account)
    }

    async fn create_account_link(
        &self,
        account_id: &str,
        _refresh_url: &str,
        _return_url: &str,
    ) -> Result<AccountLink, ProcessorError> {
        let mut state = self.lock();
        state.enter("create_account_link")?;

        if !state.accounts.contains_key(account_id) {
            return Err(not_found("account", account_id));
        }
        let link_id = state.next_id("link");
        Ok(AccountLink {
            url: format!("https://connect.mock.test/setup/{}/{}", account_id, link_id),
            expires_at: Some(chrono::Utc::now().timestamp() + 300),
        })
    }

    async fn retrieve_account(&self, account_id: &str) -> Result<Account, ProcessorError> {
        let mut state = self.lock();
        state.enter("retrieve_account")?;
        state
            .accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| not_found("account", account_id))
    }

    async fn create_checkout_session(
        &self,
        params: &CheckoutParams,
        idempotency_key: &str,
    ) -> Result<CheckoutSession, ProcessorError> {
        let mut state = self.lock();
        state.enter("create_checkout_session")?;

        if let Some(id) = state.replays.get(idempotency_key).cloned() {
            return state
                .sessions
                .get(&id)
                .cloned()
                .ok_or_else(|| not_found("checkout.session", &id));
        }

        let id = state.next_id("cs");
        let session = CheckoutSession {
            id: id.clone(),
            url: Some(format!("https://checkout.mock.test/pay/{}", id)),
            status: Some("open".to_string()),
            mode: Some("subscription".to_string()),
            subscription: None,
            customer: None,
            metadata: params.subscription_metadata(),
        };

        state.sessions.insert(id.clone(), session.clone());
        state.session_prices.insert(id.clone(), params.price_id.clone());
        state.replays.insert(idempotency_key.to_string(), id);
        Ok(session)
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, ProcessorError> {
        let mut state = self.lock();
        state.enter("retrieve_checkout_session")?;
        state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| not_found("checkout.session", session_id))
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Subscription, ProcessorError> {
        let mut state = self.lock();
        state.enter("retrieve_subscription")?;
        state
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| not_found("subscription", subscription_id))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
        _idempotency_key: &str,
    ) -> Result<Subscription, ProcessorError> {
        let mut state = self.lock();
        state.enter("cancel_subscription")?;

        let subscription = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| not_found("subscription", subscription_id))?;

        // Repeating a cancel is a no-op, same as a replayed idempotency key
        if at_period_end {
            subscription.cancel_at_period_end = true;
        } else if subscription.status != "canceled" {
            subscription.status = "canceled".to_string();
            subscription.canceled_at = Some(chrono::Utc::now().timestamp());
        }

        Ok(subscription.clone())
    }
}
