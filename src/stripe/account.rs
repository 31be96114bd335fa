use super::types::{Account, AccountLink};
use super::{FormParams, StripeClient};
use crate::models::AccountType;
use crate::processor::{CreateAccountParams, ProcessorError};

impl StripeClient {
    /// Create a connected account for a tenant
    pub async fn create_connected_account(
        &self,
        params: &CreateAccountParams,
        idempotency_key: &str,
    ) -> Result<Account, ProcessorError> {
        let account_type = match params.account_type {
            AccountType::Standard => "standard",
            AccountType::Express => "express",
            AccountType::Custom => "custom",
        };

        let mut form: FormParams = vec![
            ("type".to_string(), account_type.to_string()),
            ("country".to_string(), params.country.clone()),
            ("business_type".to_string(), params.business_type.clone()),
            ("metadata[tenant_id]".to_string(), params.tenant_id.clone()),
        ];
        if let Some(email) = &params.email {
            form.push(("email".to_string(), email.clone()));
        }
        if params.account_type != AccountType::Standard {
            form.push((
                "capabilities[card_payments][requested]".to_string(),
                "true".to_string(),
            ));
            form.push((
                "capabilities[transfers][requested]".to_string(),
                "true".to_string(),
            ));
        }

        self.post("/v1/accounts", &form, Some(idempotency_key)).await
    }

    /// Create a hosted onboarding link. Links are single-use and short-lived,
    /// so no idempotency key is sent.
    pub async fn create_onboarding_link(
        &self,
        account_id: &str,
        refresh_url: &str,
        return_url: &str,
    ) -> Result<AccountLink, ProcessorError> {
        let form: FormParams = vec![
            ("account".to_string(), account_id.to_string()),
            ("refresh_url".to_string(), refresh_url.to_string()),
            ("return_url".to_string(), return_url.to_string()),
            ("type".to_string(), "account_onboarding".to_string()),
        ];

        self.post("/v1/account_links", &form, None).await
    }

    /// Get a connected account by ID
    pub async fn get_account(&self, account_id: &str) -> Result<Account, ProcessorError> {
        let path = format!("/v1/accounts/{}", account_id);
        self.get(&path, &[]).await
    }
}
