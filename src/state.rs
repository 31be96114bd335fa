use sqlx::PgPool;
use std::sync::Arc;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::processor::PaymentProcessor;
use crate::services::account_registry::AccountRegistry;
use crate::services::subscription_ledger::SubscriptionLedger;
use crate::services::transaction_ledger::TransactionLedger;
use crate::webhooks::engine::{WebhookEngine, WebhookSettings};

/// Shared handler state. Every component receives the processor client
/// explicitly so tests can swap in the in-memory double.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub metrics: Metrics,
    pub accounts: Arc<AccountRegistry>,
    pub subscriptions: Arc<SubscriptionLedger>,
    pub transactions: Arc<TransactionLedger>,
    pub webhooks: Arc<WebhookEngine>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: Config,
        processor: Arc<dyn PaymentProcessor>,
        metrics: Metrics,
    ) -> Self {
        let accounts = Arc::new(AccountRegistry::new(
            pool.clone(),
            processor.clone(),
            metrics.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionLedger::new(
            pool.clone(),
            processor,
            metrics.clone(),
            config.default_platform_percentage,
            config.checkout_success_url.clone(),
            config.checkout_cancel_url.clone(),
        ));
        let transactions = Arc::new(TransactionLedger::new(
            pool.clone(),
            metrics.clone(),
            config.default_platform_percentage,
        ));
        let webhooks = Arc::new(WebhookEngine::new(
            pool.clone(),
            accounts.clone(),
            subscriptions.clone(),
            transactions.clone(),
            metrics.clone(),
            WebhookSettings::from_config(&config),
        ));

        Self {
            pool,
            config: Arc::new(config),
            metrics,
            accounts,
            subscriptions,
            transactions,
            webhooks,
        }
    }
}
