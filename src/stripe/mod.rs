pub mod account;
pub mod checkout;
pub mod subscription;
pub mod types;
pub mod webhook;

use crate::processor::{CheckoutParams, CreateAccountParams, PaymentProcessor, ProcessorError};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use types::ErrorBody;

/// Form-encoded request parameters, Stripe style (`metadata[key]=value`)
pub type FormParams = Vec<(String, String)>;

/// Configuration for the Stripe API client
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub api_base: String,
    pub timeout: Duration,
}

impl StripeConfig {
    pub fn from_app_config(config: &crate::config::Config) -> Self {
        Self {
            secret_key: config.stripe_secret_key.clone(),
            api_base: config.stripe_api_base.trim_end_matches('/').to_string(),
            timeout: config.stripe_timeout,
        }
    }
}

/// Stripe API client. One instance is built at startup and injected into
/// every component as `Arc<dyn PaymentProcessor>`.
#[derive(Clone)]
pub struct StripeClient {
    config: Arc<StripeConfig>,
    http_client: Client,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Result<Self, ProcessorError> {
        if config.secret_key.is_empty() {
            return Err(ProcessorError::ConfigError(
                "Stripe secret key is empty".to_string(),
            ));
        }

        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProcessorError::HttpError(e.to_string()))?;

        Ok(StripeClient {
            config: Arc::new(config),
            http_client,
        })
    }

    /// Make a GET request to the Stripe API
    pub(crate) async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProcessorError> {
        let url = format!("{}{}", self.config.api_base, path);
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.config.secret_key)
            .query(query)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Make a form-encoded POST request to the Stripe API
    pub(crate) async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &FormParams,
        idempotency_key: Option<&str>,
    ) -> Result<T, ProcessorError> {
        let url = format!("{}{}", self.config.api_base, path);
        let mut request = self
            .http_client
            .post(&url)
            .bearer_auth(&self.config.secret_key)
            .form(params);

        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await?;
        self.handle_response(response).await
    }

    /// Make a DELETE request to the Stripe API
    pub(crate) async fn delete<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        idempotency_key: Option<&str>,
    ) -> Result<T, ProcessorError> {
        let url = format!("{}{}", self.config.api_base, path);
        let mut request = self
            .http_client
            .delete(&url)
            .bearer_auth(&self.config.secret_key);

        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await?;
        self.handle_response(response).await
    }

    /// Handle HTTP response and convert to appropriate type or error
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ProcessorError> {
        let status = response.status();

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ProcessorError::ParseError(e.to_string()));
        }

        let raw = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());

        let message = serde_json::from_str::<ErrorBody>(&raw)
            .ok()
            .and_then(|body| {
                let code = body.error.code.or(body.error.error_type);
                match (code, body.error.message) {
                    (Some(code), Some(msg)) => Some(format!("{}: {}", code, msg)),
                    (None, Some(msg)) => Some(msg),
                    (Some(code), None) => Some(code),
                    (None, None) => None,
                }
            })
            .unwrap_or(raw);

        Err(ProcessorError::ApiError {
            status_code: status.as_u16(),
            message,
        })
    }
}

#[async_trait::async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_account(
        &self,
        params: &CreateAccountParams,
        idempotency_key: &str,
    ) -> Result<types::Account, ProcessorError> {
        self.create_connected_account(params, idempotency_key).await
    }

    async fn create_account_link(
        &self,
        account_id: &str,
        refresh_url: &str,
        return_url: &str,
    ) -> Result<types::AccountLink, ProcessorError> {
        self.create_onboarding_link(account_id, refresh_url, return_url)
            .await
    }

    async fn retrieve_account(&self, account_id: &str) -> Result<types::Account, ProcessorError> {
        self.get_account(account_id).await
    }

    async fn create_checkout_session(
        &self,
        params: &CheckoutParams,
        idempotency_key: &str,
    ) -> Result<types::CheckoutSession, ProcessorError> {
        self.create_subscription_checkout(params, idempotency_key)
            .await
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<types::CheckoutSession, ProcessorError> {
        self.get_checkout_session(session_id).await
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<types::Subscription, ProcessorError> {
        self.get_subscription(subscription_id).await
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
        idempotency_key: &str,
    ) -> Result<types::Subscription, ProcessorError> {
        self.cancel_remote_subscription(subscription_id, at_period_end, idempotency_key)
            .await
    }
}

/// Append `metadata[key]=value` pairs to a form
pub(crate) fn push_metadata(params: &mut FormParams, prefix: &str, metadata: &types::Metadata) {
    let mut keys: Vec<&String> = metadata.keys().collect();
    keys.sort();
    for key in keys {
        params.push((format!("{}[{}]", prefix, key), metadata[key].clone()));
    }
}
