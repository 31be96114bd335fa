//! Typed processor events
//!
//! Webhook payloads are parsed once, at ingestion, into a closed set of
//! variants. Event types without a handler map to `Unhandled` and are stored
//! but not dispatched.

use serde::de::{DeserializeOwned, Error as _};

use crate::stripe::types::{
    Account, Charge, CheckoutSession, Dispute, Event, Invoice, PaymentIntent, Subscription,
};

#[derive(Debug, Clone)]
pub enum ProcessorEvent {
    AccountUpdated(Account),
    AccountDeauthorized { account_id: String },
    CheckoutCompleted(CheckoutSession),
    SubscriptionChanged(Subscription),
    SubscriptionDeleted(Subscription),
    PaymentSucceeded(PaymentIntent),
    PaymentFailed(PaymentIntent),
    InvoicePaid(Invoice),
    ChargeRefunded(Charge),
    DisputeCreated(Dispute),
    Unhandled { event_type: String },
}

fn object<T: DeserializeOwned>(event: &Event) -> Result<T, serde_json::Error> {
    serde_json::from_value(event.data.object.clone())
}

impl ProcessorEvent {
    pub fn from_event(event: &Event) -> Result<Self, serde_json::Error> {
        let parsed = match event.event_type.as_str() {
            "account.updated" => ProcessorEvent::AccountUpdated(object(event)?),
            "account.application.deauthorized" => {
                let account_id = event.account.clone().ok_or_else(|| {
                    serde_json::Error::custom("deauthorization event without an account")
                })?;
                ProcessorEvent::AccountDeauthorized { account_id }
            }
            "checkout.session.completed" => ProcessorEvent::CheckoutCompleted(object(event)?),
            "customer.subscription.created"
            | "customer.subscription.updated"
            | "customer.subscription.trial_will_end" => {
                ProcessorEvent::SubscriptionChanged(object(event)?)
            }
            "customer.subscription.deleted" => ProcessorEvent::SubscriptionDeleted(object(event)?),
            "payment_intent.succeeded" => ProcessorEvent::PaymentSucceeded(object(event)?),
            "payment_intent.payment_failed" => ProcessorEvent::PaymentFailed(object(event)?),
            "invoice.payment_succeeded" | "invoice.paid" => ProcessorEvent::InvoicePaid(object(event)?),
            "charge.refunded" => ProcessorEvent::ChargeRefunded(object(event)?),
            "charge.dispute.created" => ProcessorEvent::DisputeCreated(object(event)?),
            other => ProcessorEvent::Unhandled {
                event_type: other.to_string(),
            },
        };
        Ok(parsed)
    }
}
