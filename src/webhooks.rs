use axum::{extract::Extension, response::IntoResponse, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::billing::ledger::BillingLedger;
use crate::billing::models::{self, Payment, PaymentStatus};
use crate::billing::reconciliation::{self, WebhookReconciler};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};

/// key: webhooks-payment -> gateway notification entrypoint
pub async fn payment_webhook(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<AppConfig>,
    Json(payload): Json<Value>,
) -> AppResult<Json<Value>> {
    let reconciler = WebhookReconciler::new(pool, &config.billing.webhook_secret);
    let outcome = reconciler.handle(payload, Utc::now()).await?;
    Ok(Json(json!({
        "success": true,
        "message": outcome.disposition.message(),
        "payment_id": outcome.payment_id,
        "disposition": outcome.disposition,
    })))
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "spp payment webhook handler",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SimulatePaymentRequest {
    pub billing_id: i64,
    pub amount: i64,
    #[serde(default)]
    pub payment_method: Option<String>,
}

/// Synthesizes a pending payment plus a signed success webhook and feeds it
/// through the reconciler, exercising the full pipeline. Dev mode only.
pub async fn simulate_payment(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<AppConfig>,
    Json(payload): Json<SimulatePaymentRequest>,
) -> AppResult<Json<Value>> {
    if !config.dev_mode {
        return Err(AppError::Forbidden);
    }
    if payload.amount <= 0 {
        return Err(AppError::Validation(vec![
            "amount must be greater than 0".to_string(),
        ]));
    }

    let billing = BillingLedger::new(pool.clone()).fetch(payload.billing_id).await?;
    let now = Utc::now();

    let payment = insert_pending_payment(
        &pool,
        &billing,
        payload.amount,
        &simulated_transaction_id("SIM"),
        &models::reference_code_with_prefix("SIM-", now),
    )
    .await?;

    let body = signed_success_payload(
        &payment,
        payload.payment_method.as_deref().unwrap_or("simulated"),
        &config.billing.webhook_secret,
        now,
    )?;

    let reconciler = WebhookReconciler::new(pool, &config.billing.webhook_secret);
    let outcome = reconciler.handle(body.clone(), now).await?;

    Ok(Json(json!({
        "success": true,
        "message": outcome.disposition.message(),
        "payment_id": outcome.payment_id,
        "simulated_payload": body,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TestAllStudentsRequest {
    #[serde(default = "default_amount_percentage")]
    pub amount_percentage: i64,
}

fn default_amount_percentage() -> i64 {
    50
}

/// Simulates a partial payment against every Unpaid/Partial billing.
/// Per-billing failures are reported, not fatal. Dev mode only.
pub async fn test_all_students(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<AppConfig>,
    payload: Option<Json<TestAllStudentsRequest>>,
) -> AppResult<impl IntoResponse> {
    if !config.dev_mode {
        return Err(AppError::Forbidden);
    }
    let percentage = payload
        .map(|Json(body)| body.amount_percentage)
        .unwrap_or_else(default_amount_percentage);
    if !(1..=100).contains(&percentage) {
        return Err(AppError::Validation(vec![
            "amount_percentage must be between 1 and 100".to_string(),
        ]));
    }

    let billings = sqlx::query_as::<_, models::Billing>(
        "SELECT * FROM billings WHERE status IN ('unpaid', 'partial') ORDER BY id",
    )
    .fetch_all(&pool)
    .await?;

    let reconciler = WebhookReconciler::new(pool.clone(), &config.billing.webhook_secret);
    let mut results = Vec::new();
    for billing in billings {
        let amount = billing.remaining_amount * percentage / 100;
        if amount == 0 {
            continue;
        }
        let now = Utc::now();
        let reference_prefix = format!("TEST-{}-", billing.student_id);

        let attempt = async {
            let payment = insert_pending_payment(
                &pool,
                &billing,
                amount,
                &simulated_transaction_id("TEST"),
                &models::reference_code_with_prefix(&reference_prefix, now),
            )
            .await?;
            let body = signed_success_payload(
                &payment,
                "test_transfer",
                &config.billing.webhook_secret,
                now,
            )?;
            reconciler.handle(body, now).await
        };

        let succeeded = match attempt.await {
            Ok(_) => true,
            Err(err) => {
                warn!(?err, billing_id = billing.id, "test payment failed");
                false
            }
        };
        results.push(json!({
            "billing_id": billing.id,
            "student_id": billing.student_id,
            "amount_paid": amount,
            "success": succeeded,
        }));
    }

    Ok(Json(json!({
        "success": true,
        "message": format!("processed {} test payments", results.len()),
        "processed": results.len(),
        "results": results,
    })))
}

async fn insert_pending_payment(
    pool: &PgPool,
    billing: &models::Billing,
    amount: i64,
    transaction_id: &str,
    reference_code: &str,
) -> AppResult<Payment> {
    let payment = sqlx::query_as::<_, Payment>(
        "INSERT INTO payments (student_id, billing_id, transaction_id, reference_code, \
         amount, status, gateway_name) VALUES ($1, $2, $3, $4, $5, $6, 'simulation') \
         RETURNING *",
    )
    .bind(billing.student_id)
    .bind(billing.id)
    .bind(transaction_id)
    .bind(reference_code)
    .bind(amount)
    .bind(PaymentStatus::Pending.as_str())
    .fetch_one(pool)
    .await
    .map_err(|e| AppError::conflict_on_unique(e, "simulated reference already exists"))?;
    Ok(payment)
}

fn simulated_transaction_id(prefix: &str) -> String {
    let hex: String = Uuid::new_v4().simple().to_string()[..12].to_uppercase();
    format!("{prefix}-{hex}")
}

fn signed_success_payload(
    payment: &Payment,
    payment_method: &str,
    secret: &str,
    now: chrono::DateTime<Utc>,
) -> AppResult<Value> {
    let mut body = json!({
        "transaction_id": payment.transaction_id,
        "reference_code": payment.reference_code,
        "billing_id": payment.billing_id,
        "student_id": payment.student_id,
        "amount": payment.amount,
        "status": "success",
        "payment_method": payment_method,
        "timestamp": now.to_rfc3339(),
    });
    let signature = reconciliation::sign_payload(&body, secret)?;
    body["signature"] = json!(signature);
    Ok(body)
}
