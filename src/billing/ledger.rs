use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{AppError, AppResult};

use super::models::{Billing, BillingStatus};
use super::penalty;

/// key: billing-ledger -> sole authority over a billing's financial state
///
/// The arithmetic lives in pure functions over the `Billing` record; the
/// ledger wraps them in row-locked transactions so concurrent applies on the
/// same billing serialize at the storage layer.
#[derive(Clone)]
pub struct BillingLedger {
    pool: PgPool,
}

/// Adds a payment to the billing and re-derives dependent fields. Rejects a
/// non-positive amount and any amount that would push `paid_amount` past
/// `total_amount` (overpayment policy: reject, never cap), keeping
/// `remaining_amount >= 0` unconditionally.
pub fn apply_payment_amounts(
    billing: &mut Billing,
    amount: i64,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let mut errors = Vec::new();
    if amount <= 0 {
        errors.push("amount must be greater than 0".to_string());
    } else if amount > billing.remaining_amount {
        errors.push(format!(
            "amount exceeds the remaining balance of {}",
            billing.remaining_amount
        ));
    }
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    billing.paid_amount += amount;
    billing.remaining_amount = billing.total_amount - billing.paid_amount;
    billing.last_payment_date = Some(now);
    billing.status =
        BillingStatus::derive(billing.paid_amount, billing.total_amount, now, billing.due_date)
            .as_str()
            .to_string();
    Ok(())
}

/// Recomputes the accrued penalty and re-derives the status. Returns whether
/// anything changed so callers can skip the write on a no-op.
pub fn apply_penalty_amounts(
    billing: &mut Billing,
    per_day_rate: i64,
    max_penalty: i64,
    now: DateTime<Utc>,
) -> bool {
    // a settled billing accrues nothing; recomputing clears any leftover
    let accrued = if billing.is_paid() {
        0
    } else {
        penalty::calculate(billing.due_date, now, per_day_rate, max_penalty)
    };
    if accrued == billing.penalty {
        return false;
    }
    billing.penalty = accrued;
    billing.status =
        BillingStatus::derive(billing.paid_amount, billing.total_amount, now, billing.due_date)
            .as_str()
            .to_string();
    true
}

/// Remaining amount while the billing is collectible, zero once Paid.
pub fn outstanding_amount(billing: &Billing) -> i64 {
    if billing.is_paid() {
        0
    } else {
        billing.remaining_amount
    }
}

impl BillingLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn fetch(&self, billing_id: i64) -> AppResult<Billing> {
        sqlx::query_as::<_, Billing>("SELECT * FROM billings WHERE id = $1")
            .bind(billing_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound("billing"))
    }

    /// Applies a payment in its own transaction.
    pub async fn apply_payment(
        &self,
        billing_id: i64,
        amount: i64,
        now: DateTime<Utc>,
    ) -> AppResult<Billing> {
        let mut tx = self.pool.begin().await?;
        let billing = Self::apply_payment_in(&mut tx, billing_id, amount, now).await?;
        tx.commit().await?;
        Ok(billing)
    }

    /// Applies a payment inside a caller-owned transaction. Locks the billing
    /// row for the duration so two concurrent applies cannot lose an update.
    pub async fn apply_payment_in(
        tx: &mut Transaction<'_, Postgres>,
        billing_id: i64,
        amount: i64,
        now: DateTime<Utc>,
    ) -> AppResult<Billing> {
        let mut billing =
            sqlx::query_as::<_, Billing>("SELECT * FROM billings WHERE id = $1 FOR UPDATE")
                .bind(billing_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(AppError::NotFound("billing"))?;

        apply_payment_amounts(&mut billing, amount, now)?;

        sqlx::query(
            "UPDATE billings SET paid_amount = $2, remaining_amount = $3, status = $4, \
             last_payment_date = $5, updated_at = NOW() WHERE id = $1",
        )
        .bind(billing.id)
        .bind(billing.paid_amount)
        .bind(billing.remaining_amount)
        .bind(&billing.status)
        .bind(billing.last_payment_date)
        .execute(&mut *tx)
        .await?;

        Ok(billing)
    }

    /// Recomputes the penalty for one billing, persisting only when it moved.
    /// Returns the billing and whether a write happened.
    pub async fn update_penalty(
        &self,
        billing_id: i64,
        per_day_rate: i64,
        max_penalty: i64,
        now: DateTime<Utc>,
    ) -> AppResult<(Billing, bool)> {
        let mut tx = self.pool.begin().await?;
        let mut billing =
            sqlx::query_as::<_, Billing>("SELECT * FROM billings WHERE id = $1 FOR UPDATE")
                .bind(billing_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(AppError::NotFound("billing"))?;

        let changed = apply_penalty_amounts(&mut billing, per_day_rate, max_penalty, now);
        if changed {
            sqlx::query(
                "UPDATE billings SET penalty = $2, status = $3, updated_at = NOW() WHERE id = $1",
            )
            .bind(billing.id)
            .bind(billing.penalty)
            .bind(&billing.status)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok((billing, changed))
    }
}
