use super::types::CheckoutSession;
use super::{push_metadata, FormParams, StripeClient};
use crate::processor::{CheckoutParams, ProcessorError};

impl StripeClient {
    /// Create a subscription-mode checkout session.
    ///
    /// Member subscriptions are destination charges: funds settle on the
    /// tenant's connected account and the platform share is withheld as an
    /// application fee.
    pub async fn create_subscription_checkout(
        &self,
        params: &CheckoutParams,
        idempotency_key: &str,
    ) -> Result<CheckoutSession, ProcessorError> {
        let mut form: FormParams = vec![
            ("mode".to_string(), "subscription".to_string()),
            ("line_items[0][price]".to_string(), params.price_id.clone()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("success_url".to_string(), params.success_url.clone()),
            ("cancel_url".to_string(), params.cancel_url.clone()),
            ("client_reference_id".to_string(), params.payer_id.clone()),
        ];

        if let Some(days) = params.trial_days.filter(|d| *d > 0) {
            form.push((
                "subscription_data[trial_period_days]".to_string(),
                days.to_string(),
            ));
        }

        if let Some(destination) = &params.destination_account {
            form.push((
                "subscription_data[transfer_data][destination]".to_string(),
                destination.clone(),
            ));
        }

        if let Some(fee) = params.application_fee_percent {
            form.push((
                "subscription_data[application_fee_percent]".to_string(),
                fee.to_string(),
            ));
        }

        let metadata = params.subscription_metadata();
        push_metadata(&mut form, "metadata", &metadata);
        push_metadata(&mut form, "subscription_data[metadata]", &metadata);

        self.post("/v1/checkout/sessions", &form, Some(idempotency_key))
            .await
    }

    /// Get a checkout session by ID
    pub async fn get_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, ProcessorError> {
        let path = format!("/v1/checkout/sessions/{}", session_id);
        self.get(&path, &[]).await
    }
}
