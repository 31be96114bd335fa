use sqlx::PgPool;
use uuid::Uuid;

use crate::models::RevenueSplit;

pub async fn find_active(pool: &PgPool, tenant_id: &str) -> Result<Option<RevenueSplit>, sqlx::Error> {
    sqlx::query_as::<_, RevenueSplit>(
        r#"
        SELECT id, tenant_id, platform_percentage, effective_from, active, deactivated_at
        FROM revenue_splits
        WHERE tenant_id = $1 AND active
        "#,
    )
    .bind(tenant_id)
    .fetch_optional(pool)
    .await
}

/// Deactivate the current split and insert a new active one, atomically.
///
/// A concurrent replacement for the same tenant fails on the one-active-row
/// index with a unique violation.
pub async fn replace_active(
    pool: &PgPool,
    tenant_id: &str,
    platform_percentage: i32,
) -> Result<RevenueSplit, sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE revenue_splits
        SET active = FALSE, deactivated_at = NOW()
        WHERE tenant_id = $1 AND active
        "#,
    )
    .bind(tenant_id)
    .execute(&mut *tx)
    .await?;

    let split = sqlx::query_as::<_, RevenueSplit>(
        r#"
        INSERT INTO revenue_splits (id, tenant_id, platform_percentage, effective_from, active)
        VALUES ($1, $2, $3, NOW(), TRUE)
        RETURNING id, tenant_id, platform_percentage, effective_from, active, deactivated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(platform_percentage)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(split)
}

/// Every split the tenant has had, newest first
pub async fn history(pool: &PgPool, tenant_id: &str) -> Result<Vec<RevenueSplit>, sqlx::Error> {
    sqlx::query_as::<_, RevenueSplit>(
        r#"
        SELECT id, tenant_id, platform_percentage, effective_from, active, deactivated_at
        FROM revenue_splits
        WHERE tenant_id = $1
        ORDER BY effective_from DESC
        "#,
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
}
