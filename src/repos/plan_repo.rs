use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{BillingInterval, Plan, SubscriptionKind};

#[derive(Debug, Clone)]
pub struct NewPlan {
    pub plan_id: String,
    pub kind: SubscriptionKind,
    /// `None` for platform-wide plans
    pub tenant_id: Option<String>,
    pub name: String,
    pub external_price_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub billing_interval: BillingInterval,
}

pub async fn insert(pool: &PgPool, plan: &NewPlan) -> Result<Plan, sqlx::Error> {
    sqlx::query_as::<_, Plan>(
        r#"
        INSERT INTO plans (
            id, plan_id, kind, tenant_id, name, external_price_id,
            amount_minor, currency, billing_interval, active
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&plan.plan_id)
    .bind(plan.kind)
    .bind(&plan.tenant_id)
    .bind(&plan.name)
    .bind(&plan.external_price_id)
    .bind(plan.amount_minor)
    .bind(&plan.currency)
    .bind(plan.billing_interval)
    .fetch_one(pool)
    .await
}

/// Active membership plans a tenant offers, cheapest first
pub async fn list_member_plans(pool: &PgPool, tenant_id: &str) -> Result<Vec<Plan>, sqlx::Error> {
    sqlx::query_as::<_, Plan>(
        r#"
        SELECT * FROM plans
        WHERE kind = 'member' AND tenant_id = $1 AND active
        ORDER BY amount_minor ASC, plan_id ASC
        "#,
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
}

/// Look up an active plan. Platform plans are not tenant-scoped, so the
/// tenant id is matched with `IS NOT DISTINCT FROM`.
pub async fn find_active(
    pool: &PgPool,
    kind: SubscriptionKind,
    tenant_id: Option<&str>,
    plan_id: &str,
) -> Result<Option<Plan>, sqlx::Error> {
    sqlx::query_as::<_, Plan>(
        r#"
        SELECT * FROM plans
        WHERE plan_id = $1
          AND kind = $2
          AND tenant_id IS NOT DISTINCT FROM $3
          AND active
        "#,
    )
    .bind(plan_id)
    .bind(kind)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await
}
