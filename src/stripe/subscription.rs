use super::types::Subscription;
use super::{FormParams, StripeClient};
use crate::processor::ProcessorError;

impl StripeClient {
    /// Get a subscription by ID
    pub async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Subscription, ProcessorError> {
        let path = format!("/v1/subscriptions/{}", subscription_id);
        self.get(&path, &[]).await
    }

    /// Cancel a subscription, either immediately or at the end of the
    /// current period
    pub async fn cancel_remote_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
        idempotency_key: &str,
    ) -> Result<Subscription, ProcessorError> {
        let path = format!("/v1/subscriptions/{}", subscription_id);

        if at_period_end {
            let form: FormParams = vec![(
                "cancel_at_period_end".to_string(),
                "true".to_string(),
            )];
            self.post(&path, &form, Some(idempotency_key)).await
        } else {
            self.delete(&path, Some(idempotency_key)).await
        }
    }
}
