use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::info;

use crate::error::{AppError, AppResult};

use super::ledger::BillingLedger;
use super::models::{self, Billing, Payment, PaymentStatus};

/// key: payment-processor -> manual/confirmed settlement entry point
#[derive(Clone)]
pub struct PaymentProcessor {
    pool: PgPool,
}

#[derive(Debug)]
pub struct ProcessedPayment {
    pub payment: Payment,
    pub billing: Billing,
}

#[derive(Debug, Serialize)]
pub struct PaymentStatistics {
    pub total_payments: i64,
    pub total_amount: i64,
    pub average_amount: i64,
}

impl PaymentProcessor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Records a confirmed payment and applies it to its billing in one
    /// transaction; a crash between the two writes is never observable.
    pub async fn process(
        &self,
        billing_id: i64,
        amount: i64,
        payment_method_id: Option<i32>,
        transaction_id: &str,
        gateway_name: &str,
        now: DateTime<Utc>,
    ) -> AppResult<ProcessedPayment> {
        if amount <= 0 {
            return Err(AppError::Validation(vec![
                "amount must be greater than 0".to_string(),
            ]));
        }
        if transaction_id.trim().is_empty() {
            return Err(AppError::Validation(vec![
                "transaction_id must not be empty".to_string(),
            ]));
        }
        if let Some(method_id) = payment_method_id {
            let exists: Option<i32> =
                sqlx::query_scalar("SELECT id FROM payment_methods WHERE id = $1")
                    .bind(method_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                return Err(AppError::NotFound("payment method"));
            }
        }

        let mut tx = self.pool.begin().await?;

        let billing = BillingLedger::apply_payment_in(&mut tx, billing_id, amount, now).await?;

        let reference_code = models::generate_reference_code(now);
        let payment = sqlx::query_as::<_, Payment>(
            "INSERT INTO payments (student_id, billing_id, payment_method_id, transaction_id, \
             reference_code, amount, status, gateway_name, payment_date, confirmation_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9) RETURNING *",
        )
        .bind(billing.student_id)
        .bind(billing.id)
        .bind(payment_method_id)
        .bind(transaction_id)
        .bind(&reference_code)
        .bind(amount)
        .bind(PaymentStatus::Confirmed.as_str())
        .bind(gateway_name)
        .bind(now)
        .fetch_one(&mut tx)
        .await
        .map_err(|e| AppError::conflict_on_unique(e, "transaction_id already recorded"))?;

        tx.commit().await?;

        info!(
            reference_code = %payment.reference_code,
            billing_id,
            amount,
            "payment processed"
        );

        Ok(ProcessedPayment { payment, billing })
    }

    pub async fn detail(&self, payment_id: i64) -> AppResult<Payment> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound("payment"))
    }

    pub async fn history(&self, student_id: i32, limit: i64) -> AppResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE student_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(student_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    /// Aggregates confirmed payments inside the window.
    pub async fn statistics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<PaymentStatistics> {
        let (total_payments, total_amount): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(amount), 0)::BIGINT FROM payments \
             WHERE status = 'confirmed' AND confirmation_date >= $1 AND confirmation_date <= $2",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        let average_amount = if total_payments > 0 {
            total_amount / total_payments
        } else {
            0
        };
        Ok(PaymentStatistics {
            total_payments,
            total_amount,
            average_amount,
        })
    }
}
