//! Payment processor boundary
//!
//! Every component receives the processor as an explicit
//! `Arc<dyn PaymentProcessor>` dependency. Production wires in
//! [`crate::stripe::StripeClient`]; tests wire in [`MockProcessor`].

pub mod error;
pub mod mock;

use async_trait::async_trait;

use crate::models::{AccountType, SubscriptionKind};
use crate::stripe::types::{Account, AccountLink, CheckoutSession, Metadata, Subscription};

pub use error::ProcessorError;
pub use mock::MockProcessor;

/// Parameters for creating a connected account
#[derive(Debug, Clone)]
pub struct CreateAccountParams {
    pub tenant_id: String,
    pub account_type: AccountType,
    pub country: String,
    pub business_type: String,
    pub email: Option<String>,
}

/// Parameters for a subscription checkout session
#[derive(Debug, Clone)]
pub struct CheckoutParams {
    pub kind: SubscriptionKind,
    pub tenant_id: String,
    pub payer_id: String,
    pub plan_id: String,
    pub price_id: String,
    pub trial_days: Option<u32>,
    pub success_url: String,
    pub cancel_url: String,
    /// Destination account for member subscriptions
    pub destination_account: Option<String>,
    /// Platform share, collected as an application fee on member payments
    pub application_fee_percent: Option<i32>,
}

impl CheckoutParams {
    /// Metadata stamped on the processor subscription so lifecycle
    /// notifications can be mapped back to local parties.
    pub fn subscription_metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("tenant_id".to_string(), self.tenant_id.clone());
        metadata.insert("payer_id".to_string(), self.payer_id.clone());
        metadata.insert("kind".to_string(), self.kind.as_str().to_string());
        metadata.insert("plan_id".to_string(), self.plan_id.clone());
        metadata
    }
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_account(
        &self,
        params: &CreateAccountParams,
        idempotency_key: &str,
    ) -> Result<Account, ProcessorError>;

    async fn create_account_link(
        &self,
        account_id: &str,
        refresh_url: &str,
        return_url: &str,
    ) -> Result<AccountLink, ProcessorError>;

    async fn retrieve_account(&self, account_id: &str) -> Result<Account, ProcessorError>;

    async fn create_checkout_session(
        &self,
        params: &CheckoutParams,
        idempotency_key: &str,
    ) -> Result<CheckoutSession, ProcessorError>;

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, ProcessorError>;

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Subscription, ProcessorError>;

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
        idempotency_key: &str,
    ) -> Result<Subscription, ProcessorError>;
}

/// Deterministic idempotency key for one logical processor operation
pub fn idempotency_key(operation: &str, parts: &[&str]) -> String {
    let name = format!("{}:{}", operation, parts.join(":"));
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}
