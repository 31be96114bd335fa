//! Revenue split policy
//!
//! Splits are whole percentages applied to minor-unit amounts with integer
//! arithmetic only. The platform share is rounded half-to-even and the
//! creator receives the remainder, so the two parts always sum to the
//! original amount.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

use crate::error::{is_unique_violation, AppError, AppResult, ConflictKind};
use crate::models::RevenueSplit;
use crate::repos::split_repo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitPolicy {
    platform_percentage: i32,
}

impl SplitPolicy {
    pub fn new(platform_percentage: i32) -> AppResult<Self> {
        if !(0..=100).contains(&platform_percentage) {
            return Err(AppError::validation(format!(
                "platformPercentage must be between 0 and 100, got {}",
                platform_percentage
            )));
        }
        Ok(Self {
            platform_percentage,
        })
    }

    /// Everything goes to the platform (rent payments)
    pub fn platform_only() -> Self {
        Self {
            platform_percentage: 100,
        }
    }

    pub fn platform_percentage(&self) -> i32 {
        self.platform_percentage
    }

    /// Always derived; never stored or set independently
    pub fn creator_percentage(&self) -> i32 {
        100 - self.platform_percentage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitAmounts {
    pub platform_amount: i64,
    pub creator_amount: i64,
}

/// `numerator / denominator` for non-negative operands, ties to even
fn round_half_even(numerator: i128, denominator: i128) -> i128 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;

    match (remainder * 2).cmp(&denominator) {
        std::cmp::Ordering::Greater => quotient + 1,
        std::cmp::Ordering::Less => quotient,
        std::cmp::Ordering::Equal => quotient + (quotient & 1),
    }
}

/// Partition a minor-unit amount between platform and creator.
///
/// Negative amounts (refunds, chargebacks) split symmetrically, so reversing
/// a payment in full reverses exactly the shares it produced.
pub fn compute_split(amount: i64, policy: SplitPolicy) -> SplitAmounts {
    let magnitude = i128::from(amount).abs();
    let rounded = round_half_even(magnitude * i128::from(policy.platform_percentage), 100);

    // rounded <= |amount|, so it fits back into i64
    let platform_magnitude = rounded as i64;
    let platform_amount = if amount < 0 {
        -platform_magnitude
    } else {
        platform_magnitude
    };

    SplitAmounts {
        platform_amount,
        creator_amount: amount - platform_amount,
    }
}

/// What an original payment was recorded with and how much of it has
/// already been reversed. All values are non-negative magnitudes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReversalBasis {
    pub original_amount: i64,
    pub original_platform_amount: i64,
    pub reversed_amount: i64,
    pub reversed_platform_amount: i64,
}

/// Negative split for reversing `amount` more of an original payment.
///
/// The platform share reversed so far is pro-rated from the original row's
/// platform amount, so any sequence of partial reversals that adds up to the
/// original returns exactly the shares it was recorded with. Reversals past
/// the original amount fall back to the percentage.
pub fn reversal_split(basis: ReversalBasis, amount: i64, policy: SplitPolicy) -> SplitAmounts {
    let cumulative = basis.reversed_amount.saturating_add(amount);
    if amount <= 0 || basis.original_amount <= 0 || cumulative > basis.original_amount {
        return compute_split(-amount, policy);
    }

    let cumulative_platform = round_half_even(
        i128::from(basis.original_platform_amount) * i128::from(cumulative),
        i128::from(basis.original_amount),
    ) as i64;
    let platform = (cumulative_platform - basis.reversed_platform_amount).clamp(0, amount);

    SplitAmounts {
        platform_amount: -platform,
        creator_amount: -(amount - platform),
    }
}

/// Tenant split as exposed over HTTP
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitView {
    pub tenant_id: String,
    pub platform_percentage: i32,
    pub creator_percentage: i32,
    pub effective_from: Option<DateTime<Utc>>,
    /// True when no split was ever configured and the service default applies
    pub is_default: bool,
    pub history: Vec<RevenueSplit>,
}

/// Policy currently in force for a tenant, falling back to the default
pub async fn active_policy(
    pool: &PgPool,
    tenant_id: &str,
    default_percentage: i32,
) -> AppResult<SplitPolicy> {
    match split_repo::find_active(pool, tenant_id).await? {
        Some(split) => SplitPolicy::new(split.platform_percentage),
        None => SplitPolicy::new(default_percentage),
    }
}

pub async fn get_split(pool: &PgPool, tenant_id: &str, default_percentage: i32) -> AppResult<SplitView> {
    let history = split_repo::history(pool, tenant_id).await?;
    let active = history.iter().find(|s| s.active);

    let (policy, effective_from) = match active {
        Some(split) => (SplitPolicy::new(split.platform_percentage)?, Some(split.effective_from)),
        None => (SplitPolicy::new(default_percentage)?, None),
    };

    Ok(SplitView {
        tenant_id: tenant_id.to_string(),
        platform_percentage: policy.platform_percentage(),
        creator_percentage: policy.creator_percentage(),
        effective_from,
        is_default: active.is_none(),
        history,
    })
}

/// Replace the tenant's split. Prior rows are deactivated, never edited.
pub async fn set_split(pool: &PgPool, tenant_id: &str, platform_percentage: i32) -> AppResult<RevenueSplit> {
    if tenant_id.trim().is_empty() {
        return Err(AppError::validation("tenantId is required"));
    }
    let policy = SplitPolicy::new(platform_percentage)?;

    let split = split_repo::replace_active(pool, tenant_id, policy.platform_percentage())
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(ConflictKind::ConcurrentSplitChange(tenant_id.to_string()))
            } else {
                AppError::Database(e)
            }
        })?;

    tracing::info!(
        tenant_id = %tenant_id,
        platform_percentage = split.platform_percentage,
        "Revenue split updated"
    );

    Ok(split)
}
