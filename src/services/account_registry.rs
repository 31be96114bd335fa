use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;

use crate::error::{is_unique_violation, AppError, AppResult, ConflictKind};
use crate::metrics::Metrics;
use crate::models::{Account, AccountType, VerificationStatus};
use crate::processor::{idempotency_key, CreateAccountParams, PaymentProcessor};
use crate::repos::account_repo::{self, AccountStatusUpdate, NewAccount};
use crate::repos::tenant_repo;
use crate::stripe::types as remote;

#[derive(Debug, Clone)]
pub struct OnboardingRequest {
    pub tenant_id: String,
    pub account_type: AccountType,
    pub country: String,
    pub business_type: String,
    pub email: Option<String>,
    pub return_url: String,
    pub refresh_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingLink {
    pub account_id: String,
    #[serde(rename = "onboardingURL")]
    pub onboarding_url: String,
}

/// Capability and verification snapshot for one account
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    pub account_id: String,
    pub tenant_id: String,
    pub verification_status: VerificationStatus,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
    pub requirements: Vec<String>,
    pub disabled_reason: Option<String>,
    pub onboarding_complete: bool,
}

/// Local account joined with live processor state when reachable
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    #[serde(flatten)]
    pub account: Account,
    pub onboarding_complete: bool,
    pub live_status: Option<AccountStatus>,
}

/// Derive local verification state from the processor's account object
pub fn derive_verification_status(account: &remote::Account) -> VerificationStatus {
    if account.charges_enabled && account.payouts_enabled {
        return VerificationStatus::Verified;
    }
    match account.disabled_reason() {
        Some(reason) if reason.starts_with("rejected") => VerificationStatus::Rejected,
        Some(_) => VerificationStatus::Restricted,
        None if account.details_submitted
            && account
                .requirements
                .as_ref()
                .is_some_and(|r| !r.past_due.is_empty()) =>
        {
            VerificationStatus::Restricted
        }
        None => VerificationStatus::Pending,
    }
}

fn status_update(account: &remote::Account) -> AccountStatusUpdate {
    AccountStatusUpdate {
        verification_status: derive_verification_status(account),
        charges_enabled: account.charges_enabled,
        payouts_enabled: account.payouts_enabled,
        details_submitted: account.details_submitted,
        requirements: json!(account.outstanding_requirements()),
        capabilities: json!(account.capabilities.clone().unwrap_or_default()),
    }
}

/// Tracks each tenant's connected account and mirrors its remote status
pub struct AccountRegistry {
    pool: PgPool,
    processor: Arc<dyn PaymentProcessor>,
    metrics: Metrics,
}

impl AccountRegistry {
    pub fn new(pool: PgPool, processor: Arc<dyn PaymentProcessor>, metrics: Metrics) -> Self {
        Self {
            pool,
            processor,
            metrics,
        }
    }

    /// Create the processor account and hosted onboarding link for a tenant.
    ///
    /// The existence check runs before any processor call. The create call
    /// carries a key derived from the tenant, so if the local insert fails
    /// after the account was created remotely, retrying replays the same
    /// remote account instead of orphaning a second one.
    pub async fn begin_onboarding(&self, req: &OnboardingRequest) -> AppResult<OnboardingLink> {
        if req.tenant_id.trim().is_empty() {
            return Err(AppError::validation("tenantId is required"));
        }

        if account_repo::find_by_tenant(&self.pool, &req.tenant_id)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(ConflictKind::AccountAlreadyExists(
                req.tenant_id.clone(),
            )));
        }

        let params = CreateAccountParams {
            tenant_id: req.tenant_id.clone(),
            account_type: req.account_type,
            country: req.country.clone(),
            business_type: req.business_type.clone(),
            email: req.email.clone(),
        };
        let key = idempotency_key("create_account", &[&req.tenant_id]);
        let result = self.processor.create_account(&params, &key).await;
        self.metrics.record_processor_call("create_account", &result);
        let remote_account = result?;

        let result = self
            .processor
            .create_account_link(&remote_account.id, &req.refresh_url, &req.return_url)
            .await;
        self.metrics.record_processor_call("create_account_link", &result);
        let link = result?;

        let new_account = NewAccount {
            tenant_id: req.tenant_id.clone(),
            external_account_id: remote_account.id.clone(),
            account_type: req.account_type,
            country: req.country.clone(),
            requirements: json!(remote_account.outstanding_requirements()),
            capabilities: json!(remote_account.capabilities.clone().unwrap_or_default()),
            metadata: json!(remote_account.metadata),
        };

        let account = account_repo::insert(&self.pool, &new_account)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Conflict(ConflictKind::AccountAlreadyExists(req.tenant_id.clone()))
                } else {
                    tracing::error!(
                        tenant_id = %req.tenant_id,
                        external_account_id = %remote_account.id,
                        error = %e,
                        "Remote account created but local insert failed"
                    );
                    AppError::Database(e)
                }
            })?;

        tracing::info!(
            tenant_id = %account.tenant_id,
            external_account_id = %account.external_account_id,
            "Onboarding started"
        );

        Ok(OnboardingLink {
            account_id: account.external_account_id,
            onboarding_url: link.url,
        })
    }

    /// Issue a fresh onboarding link; links are single-use and expire quickly
    pub async fn refresh_onboarding_link(
        &self,
        tenant_id: &str,
        return_url: &str,
        refresh_url: &str,
    ) -> AppResult<OnboardingLink> {
        let account = account_repo::find_by_tenant(&self.pool, tenant_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("No account for tenant {}", tenant_id)))?;

        let result = self
            .processor
            .create_account_link(&account.external_account_id, refresh_url, return_url)
            .await;
        self.metrics.record_processor_call("create_account_link", &result);
        let link = result?;

        Ok(OnboardingLink {
            account_id: account.external_account_id,
            onboarding_url: link.url,
        })
    }

    /// Pull the account's current state from the processor and mirror it
    /// locally. Safe to call any number of times.
    pub async fn sync_status(&self, external_account_id: &str) -> AppResult<AccountStatus> {
        if account_repo::find_by_external_id(&self.pool, external_account_id)
            .await?
            .is_none()
        {
            return Err(AppError::not_found(format!(
                "Unknown account {}",
                external_account_id
            )));
        }

        let result = self.processor.retrieve_account(external_account_id).await;
        self.metrics.record_processor_call("retrieve_account", &result);
        let remote_account = result?;

        self.apply_remote_status(&remote_account).await
    }

    /// Write remote status and, the first time both capabilities are on,
    /// the tenant's onboarding flag, in one transaction
    async fn apply_remote_status(&self, remote_account: &remote::Account) -> AppResult<AccountStatus> {
        let update = status_update(remote_account);

        let mut tx = self.pool.begin().await?;
        let (before, after) = account_repo::update_status(&mut tx, &remote_account.id, &update)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Unknown account {}", remote_account.id)))?;

        let mut onboarding_complete = false;
        if after.charges_enabled && after.payouts_enabled {
            let newly_completed = tenant_repo::mark_onboarding_complete(&mut tx, &after.tenant_id).await?;
            if newly_completed {
                tracing::info!(
                    tenant_id = %after.tenant_id,
                    external_account_id = %after.external_account_id,
                    "Tenant onboarding complete"
                );
            }
            onboarding_complete = true;
        }
        tx.commit().await?;

        if before.verification_status != after.verification_status {
            tracing::info!(
                external_account_id = %after.external_account_id,
                from = ?before.verification_status,
                to = ?after.verification_status,
                "Account verification status changed"
            );
        }

        if !onboarding_complete {
            onboarding_complete =
                tenant_repo::is_onboarding_complete(&self.pool, &after.tenant_id).await?;
        }

        Ok(AccountStatus {
            account_id: after.external_account_id,
            tenant_id: after.tenant_id,
            verification_status: after.verification_status,
            charges_enabled: after.charges_enabled,
            payouts_enabled: after.payouts_enabled,
            details_submitted: after.details_submitted,
            requirements: remote_account.outstanding_requirements(),
            disabled_reason: remote_account.disabled_reason().map(str::to_string),
            onboarding_complete,
        })
    }

    /// Soft-disable after the tenant disconnected the platform. Unknown
    /// accounts are ignored.
    pub async fn deauthorize(&self, external_account_id: &str) -> AppResult<()> {
        match account_repo::disable(&self.pool, external_account_id).await? {
            Some(account) => {
                tracing::warn!(
                    tenant_id = %account.tenant_id,
                    external_account_id = %external_account_id,
                    "Connected account deauthorized; charges disabled"
                );
            }
            None => {
                tracing::warn!(
                    external_account_id = %external_account_id,
                    "Deauthorization for unknown account ignored"
                );
            }
        }
        Ok(())
    }

    /// Local account plus live status. A transient processor failure
    /// degrades to the cached row; other processor errors fail the read.
    pub async fn get_account(&self, tenant_id: &str) -> AppResult<AccountView> {
        let account = account_repo::find_by_tenant(&self.pool, tenant_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("No account for tenant {}", tenant_id)))?;

        let live_status = match self.sync_status(&account.external_account_id).await {
            Ok(status) => Some(status),
            Err(AppError::ExternalService(e)) if e.is_transient() => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    error = %e,
                    "Live account status unavailable; serving cached state"
                );
                None
            }
            Err(e) => return Err(e),
        };

        // Re-read so the view reflects the sync that just ran
        let account = account_repo::find_by_tenant(&self.pool, tenant_id)
            .await?
            .unwrap_or(account);
        let onboarding_complete = tenant_repo::is_onboarding_complete(&self.pool, tenant_id).await?;

        Ok(AccountView {
            account,
            onboarding_complete,
            live_status,
        })
    }
}
