use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{Account, AccountType, VerificationStatus};

/// Fields persisted when onboarding starts
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub tenant_id: String,
    pub external_account_id: String,
    pub account_type: AccountType,
    pub country: String,
    pub requirements: JsonValue,
    pub capabilities: JsonValue,
    pub metadata: JsonValue,
}

/// Remote capability and verification state mirrored onto the local row
#[derive(Debug, Clone)]
pub struct AccountStatusUpdate {
    pub verification_status: VerificationStatus,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
    pub requirements: JsonValue,
    pub capabilities: JsonValue,
}

pub async fn find_by_tenant(pool: &PgPool, tenant_id: &str) -> Result<Option<Account>, sqlx::Error> {
    sqlx::query_as::<_, Account>("SELECT * FROM connected_accounts WHERE tenant_id = $1")
        .bind(tenant_id)
        .fetch_optional(pool)
        .await
}

pub async fn find_by_external_id(
    pool: &PgPool,
    external_account_id: &str,
) -> Result<Option<Account>, sqlx::Error> {
    sqlx::query_as::<_, Account>(
        "SELECT * FROM connected_accounts WHERE external_account_id = $1",
    )
    .bind(external_account_id)
    .fetch_optional(pool)
    .await
}

/// Insert a new account in `pending` with both capability flags off.
/// The unique tenant constraint surfaces as a database error to the caller.
pub async fn insert(pool: &PgPool, account: &NewAccount) -> Result<Account, sqlx::Error> {
    sqlx::query_as::<_, Account>(
        r#"
        INSERT INTO connected_accounts (
            id, tenant_id, external_account_id, account_type, country,
            verification_status, charges_enabled, payouts_enabled, details_submitted,
            requirements, capabilities, metadata
        )
        VALUES ($1, $2, $3, $4, $5, 'pending', FALSE, FALSE, FALSE, $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&account.tenant_id)
    .bind(&account.external_account_id)
    .bind(account.account_type)
    .bind(&account.country)
    .bind(&account.requirements)
    .bind(&account.capabilities)
    .bind(&account.metadata)
    .fetch_one(pool)
    .await
}

/// Apply remote status inside the caller's transaction. Returns the row as it
/// was before the update together with the updated row.
pub async fn update_status(
    tx: &mut Transaction<'_, Postgres>,
    external_account_id: &str,
    update: &AccountStatusUpdate,
) -> Result<Option<(Account, Account)>, sqlx::Error> {
    let before = sqlx::query_as::<_, Account>(
        "SELECT * FROM connected_accounts WHERE external_account_id = $1 FOR UPDATE",
    )
    .bind(external_account_id)
    .fetch_optional(&mut **tx)
    .await?;

    let Some(before) = before else {
        return Ok(None);
    };

    let after = sqlx::query_as::<_, Account>(
        r#"
        UPDATE connected_accounts
        SET verification_status = $2,
            charges_enabled = $3,
            payouts_enabled = $4,
            details_submitted = $5,
            requirements = $6,
            capabilities = $7,
            updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(before.id)
    .bind(update.verification_status)
    .bind(update.charges_enabled)
    .bind(update.payouts_enabled)
    .bind(update.details_submitted)
    .bind(&update.requirements)
    .bind(&update.capabilities)
    .fetch_one(&mut **tx)
    .await?;

    Ok(Some((before, after)))
}

/// Soft-disable an account after the processor revoked platform access
pub async fn disable(
    pool: &PgPool,
    external_account_id: &str,
) -> Result<Option<Account>, sqlx::Error> {
    sqlx::query_as::<_, Account>(
        r#"
        UPDATE connected_accounts
        SET disabled_at = COALESCE(disabled_at, NOW()),
            charges_enabled = FALSE,
            payouts_enabled = FALSE,
            updated_at = NOW()
        WHERE external_account_id = $1
        RETURNING *
        "#,
    )
    .bind(external_account_id)
    .fetch_optional(pool)
    .await
}
