use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Common metadata type
pub type Metadata = HashMap<String, String>;

/// Connected account response from the Stripe API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(rename = "type")]
    pub account_type: Option<String>,
    pub country: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub details_submitted: bool,
    pub requirements: Option<Requirements>,
    pub capabilities: Option<HashMap<String, String>>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Account {
    /// Requirements that are due now or overdue
    pub fn outstanding_requirements(&self) -> Vec<String> {
        let Some(req) = &self.requirements else {
            return Vec::new();
        };
        let mut due: Vec<String> = req
            .currently_due
            .iter()
            .chain(req.past_due.iter())
            .cloned()
            .collect();
        due.sort();
        due.dedup();
        due
    }

    pub fn disabled_reason(&self) -> Option<&str> {
        self.requirements
            .as_ref()
            .and_then(|r| r.disabled_reason.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub currently_due: Vec<String>,
    #[serde(default)]
    pub past_due: Vec<String>,
    #[serde(default)]
    pub eventually_due: Vec<String>,
    pub disabled_reason: Option<String>,
}

/// Hosted onboarding link for a connected account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountLink {
    pub url: String,
    pub expires_at: Option<i64>,
}

/// Checkout session response from the Stripe API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
    pub status: Option<String>,
    pub mode: Option<String>,
    pub subscription: Option<String>,
    pub customer: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Subscription response from the Stripe API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub customer: String,
    pub status: String,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub trial_start: Option<i64>,
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub items: ListResponse<SubscriptionItem>,
}

impl Subscription {
    pub fn first_item(&self) -> Option<&SubscriptionItem> {
        self.items.data.first()
    }

    /// Period bounds, read from the subscription or, on newer API versions,
    /// from its first item.
    pub fn period(&self) -> (Option<i64>, Option<i64>) {
        let item = self.first_item();
        (
            self.current_period_start
                .or_else(|| item.and_then(|i| i.current_period_start)),
            self.current_period_end
                .or_else(|| item.and_then(|i| i.current_period_end)),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    pub price: Price,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub id: String,
    pub unit_amount: Option<i64>,
    pub currency: String,
    pub recurring: Option<Recurring>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recurring {
    pub interval: String,
}

/// Payment intent response from the Stripe API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub amount: i64,
    pub amount_received: Option<i64>,
    pub currency: String,
    pub status: String,
    pub latest_charge: Option<String>,
    pub invoice: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub last_payment_error: Option<PaymentError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentError {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Invoice response from the Stripe API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub charge: Option<String>,
    pub payment_intent: Option<String>,
    pub subscription: Option<String>,
    pub customer: Option<String>,
    pub amount_paid: i64,
    pub currency: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub metadata: Metadata,
}

/// Charge response from the Stripe API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub amount_refunded: i64,
    pub currency: String,
    pub payment_intent: Option<String>,
    pub refunds: Option<ListResponse<Refund>>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Refund response from the Stripe API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: Option<String>,
    pub charge: Option<String>,
}

/// Dispute response from the Stripe API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub charge: String,
    pub payment_intent: Option<String>,
    pub reason: Option<String>,
    pub status: Option<String>,
}

/// Webhook event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
    pub account: Option<String>,
    #[serde(default)]
    pub livemode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// List response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

impl<T> Default for ListResponse<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            has_more: false,
        }
    }
}

/// Error body returned by the Stripe API on non-2xx responses
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
}
