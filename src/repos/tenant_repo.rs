use sqlx::{PgPool, Postgres, Transaction};

/// Flip the tenant's onboarding flag. Returns true only for the call that
/// actually set it, so repeated syncs have no further side effect.
pub async fn mark_onboarding_complete(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
) -> Result<bool, sqlx::Error> {
    let marked = sqlx::query_scalar::<_, String>(
        r#"
        INSERT INTO tenants (id, onboarding_complete, onboarding_completed_at)
        VALUES ($1, TRUE, NOW())
        ON CONFLICT (id) DO UPDATE
        SET onboarding_complete = TRUE,
            onboarding_completed_at = NOW()
        WHERE NOT tenants.onboarding_complete
        RETURNING id
        "#,
    )
    .bind(tenant_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(marked.is_some())
}

pub async fn is_onboarding_complete(pool: &PgPool, tenant_id: &str) -> Result<bool, sqlx::Error> {
    let complete = sqlx::query_scalar::<_, bool>(
        "SELECT onboarding_complete FROM tenants WHERE id = $1",
    )
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;

    Ok(complete.unwrap_or(false))
}
