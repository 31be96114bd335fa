use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

// ============================================================================
// ENUMS (mirrored as Postgres enum types)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "account_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Standard,
    Express,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "verification_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Rejected,
    Restricted,
}

/// Which two parties a subscription binds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionKind {
    /// Platform operator charges the tenant (rent)
    Platform,
    /// End user pays the tenant for community access
    Member,
}

impl SubscriptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionKind::Platform => "platform",
            SubscriptionKind::Member => "member",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "platform" => Some(SubscriptionKind::Platform),
            "member" => Some(SubscriptionKind::Member),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
        }
    }

    /// Parse the processor's status string. Statuses outside the local
    /// lifecycle (e.g. `paused`) yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Some(SubscriptionStatus::IncompleteExpired),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::IncompleteExpired
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "billing_interval", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "month" => Some(BillingInterval::Month),
            "year" => Some(BillingInterval::Year),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Payment,
    Refund,
    Chargeback,
    Split,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Succeeded,
    Failed,
    Canceled,
}

/// Processing state of a stored webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "webhook_event_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Processing,
    Processed,
    Failed,
    DeadLettered,
}

// ============================================================================
// ROWS
// ============================================================================

/// Connected account record from connected_accounts table
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: Uuid,
    pub tenant_id: String,
    pub external_account_id: String,
    pub account_type: AccountType,
    pub country: String,
    pub verification_status: VerificationStatus,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
    pub requirements: JsonValue,
    pub capabilities: JsonValue,
    pub metadata: JsonValue,
    pub disabled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn can_accept_charges(&self) -> bool {
        self.charges_enabled && self.disabled_at.is_none()
    }
}

/// Revenue split record from revenue_splits table
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RevenueSplit {
    pub id: Uuid,
    pub tenant_id: String,
    pub platform_percentage: i32,
    pub effective_from: DateTime<Utc>,
    pub active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
}

/// Plan record from plans table
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: Uuid,
    pub plan_id: String,
    pub kind: SubscriptionKind,
    pub tenant_id: Option<String>,
    pub name: String,
    pub external_price_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub billing_interval: BillingInterval,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Subscription record from subscriptions table (both variants)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: Uuid,
    pub kind: SubscriptionKind,
    pub tenant_id: String,
    pub payer_id: String,
    pub external_subscription_id: String,
    pub external_customer_id: String,
    pub plan_id: String,
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
    pub last_invoiced_at: Option<DateTime<Utc>>,
    /// Processor time of the newest notification applied
    pub last_event_at: Option<DateTime<Utc>>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ledger row from transactions table (append-only)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub tenant_id: String,
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
    pub processed_at: DateTime<Utc>,
    pub metadata: JsonValue,
}

/// Idempotency ledger row from processed_events table
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: JsonValue,
    pub status: WebhookEventStatus,
    pub processed: bool,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// RESPONSE ENVELOPE
// ============================================================================

/// Success envelope: `{ "success": true, "data": ... }`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Failure envelope: `{ "success": false, "error": ..., "message": ... }`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            message: message.into(),
        }
    }
}
