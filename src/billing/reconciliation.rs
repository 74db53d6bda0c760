use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};

use super::ledger::BillingLedger;
use super::models::{Payment, PaymentStatus, ReconciliationStatus};

type HmacSha256 = Hmac<Sha256>;

/// key: billing-reconciliation -> idempotent gateway webhook application
///
/// The reconciler trusts nothing: the payload must prove authenticity via
/// HMAC, every field is validated (all violations reported together), and the
/// referenced Payment must already exist. Redelivered success notifications
/// for an already-confirmed payment are acknowledged without touching the
/// ledger. Every processing attempt leaves a PaymentReconciliation row.
#[derive(Clone)]
pub struct WebhookReconciler {
    pool: PgPool,
    secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookDisposition {
    Applied,
    AlreadyProcessed,
    MarkedFailed,
    AcknowledgedPending,
}

impl WebhookDisposition {
    pub fn message(&self) -> &'static str {
        match self {
            WebhookDisposition::Applied => "payment confirmed and applied",
            WebhookDisposition::AlreadyProcessed => "payment already processed",
            WebhookDisposition::MarkedFailed => "payment marked failed",
            WebhookDisposition::AcknowledgedPending => "pending notification acknowledged",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookOutcome {
    pub payment_id: i64,
    pub disposition: WebhookDisposition,
}

/// Canonical form signed by the gateway: the payload object minus its
/// `signature` field, serialized with lexicographically sorted keys
/// (serde_json object maps are BTree-backed, so plain serialization is
/// already canonical).
pub fn canonical_message(payload: &Value) -> AppResult<String> {
    let Value::Object(fields) = payload else {
        return Err(AppError::Validation(vec![
            "payload must be a JSON object".to_string(),
        ]));
    };
    let mut canonical = fields.clone();
    canonical.remove("signature");
    serde_json::to_string(&Value::Object(canonical))
        .map_err(|e| AppError::Internal(format!("payload serialization failed: {e}")))
}

/// Hex HMAC-SHA256 digest over the canonical message. Used by the simulation
/// initiators and by tests to produce payloads the reconciler will accept.
pub fn sign_payload(payload: &Value, secret: &str) -> AppResult<String> {
    let message = canonical_message(payload)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can use any key length");
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time signature check; any shortfall is Unauthorized.
pub fn verify_signature(payload: &Value, secret: &str) -> AppResult<()> {
    let signature = payload
        .get("signature")
        .and_then(|v| v.as_str())
        .ok_or(AppError::Unauthorized)?;
    let provided = hex::decode(signature).map_err(|_| AppError::Unauthorized)?;

    let message = canonical_message(payload)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can use any key length");
    mac.update(message.as_bytes());
    mac.verify_slice(&provided).map_err(|_| AppError::Unauthorized)
}

#[derive(Debug)]
pub struct WebhookFields {
    pub transaction_id: String,
    pub reference_code: String,
    pub billing_id: i64,
    pub student_id: i64,
    pub amount: i64,
    pub status: String,
}

#[derive(Default)]
struct RawFields {
    transaction_id: Option<String>,
    reference_code: Option<String>,
    billing_id: Option<i64>,
    student_id: Option<i64>,
    amount: Option<i64>,
    status: Option<String>,
    errors: Vec<String>,
}

fn parse_fields(payload: &Value) -> RawFields {
    let mut raw = RawFields::default();

    raw.transaction_id = string_field(payload, "transaction_id", &mut raw.errors);
    raw.reference_code = string_field(payload, "reference_code", &mut raw.errors);
    raw.billing_id = integer_field(payload, "billing_id", &mut raw.errors);
    raw.student_id = integer_field(payload, "student_id", &mut raw.errors);

    raw.amount = integer_field(payload, "amount", &mut raw.errors);
    if let Some(amount) = raw.amount {
        if amount <= 0 {
            raw.errors.push("amount must be greater than 0".to_string());
        }
    }

    raw.status = string_field(payload, "status", &mut raw.errors);
    if let Some(status) = &raw.status {
        if !matches!(status.as_str(), "success" | "pending" | "failed") {
            raw.errors
                .push("status must be one of: success, pending, failed".to_string());
        }
    }

    raw
}

fn string_field(payload: &Value, name: &str, errors: &mut Vec<String>) -> Option<String> {
    match payload.get(name).and_then(|v| v.as_str()) {
        Some(value) if !value.trim().is_empty() => Some(value.to_string()),
        _ => {
            errors.push(format!("missing required field: {name}"));
            None
        }
    }
}

fn integer_field(payload: &Value, name: &str, errors: &mut Vec<String>) -> Option<i64> {
    match payload.get(name).and_then(|v| v.as_i64()) {
        Some(value) => Some(value),
        None => {
            errors.push(format!("missing required field: {name}"));
            None
        }
    }
}

impl WebhookReconciler {
    pub fn new(pool: PgPool, secret: impl Into<String>) -> Self {
        Self {
            pool,
            secret: secret.into(),
        }
    }

    /// Processes one gateway notification end to end. No write happens before
    /// the signature and every field have been verified.
    pub async fn handle(&self, payload: Value, now: DateTime<Utc>) -> AppResult<WebhookOutcome> {
        verify_signature(&payload, &self.secret)?;
        let fields = self.validate(&payload).await?;

        let payment = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE reference_code = $1",
        )
        .bind(&fields.reference_code)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("payment"))?;

        if payment.billing_id != fields.billing_id {
            return Err(AppError::Validation(vec![format!(
                "billing_id {} does not match the referenced payment",
                fields.billing_id
            )]));
        }

        match fields.status.as_str() {
            "success" => self.apply_success(&payment, &fields, &payload, now).await,
            "failed" => self.mark_failed(&payment, &payload).await,
            _ => self.acknowledge_pending(&payment, &payload).await,
        }
    }

    /// Collects every violated field before rejecting, including a billing
    /// reference that resolves to nothing.
    async fn validate(&self, payload: &Value) -> AppResult<WebhookFields> {
        let mut raw = parse_fields(payload);

        if let Some(billing_id) = raw.billing_id {
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT id FROM billings WHERE id = $1")
                    .bind(billing_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                raw.errors.push(format!("billing {billing_id} not found"));
            }
        }

        match (
            raw.transaction_id,
            raw.reference_code,
            raw.billing_id,
            raw.student_id,
            raw.amount,
            raw.status,
        ) {
            (Some(transaction_id), Some(reference_code), Some(billing_id), Some(student_id), Some(amount), Some(status))
                if raw.errors.is_empty() =>
            {
                Ok(WebhookFields {
                    transaction_id,
                    reference_code,
                    billing_id,
                    student_id,
                    amount,
                    status,
                })
            }
            _ => {
                warn!(errors = ?raw.errors, "webhook payload validation failed");
                Err(AppError::Validation(raw.errors))
            }
        }
    }

    async fn apply_success(
        &self,
        payment: &Payment,
        fields: &WebhookFields,
        payload: &Value,
        now: DateTime<Utc>,
    ) -> AppResult<WebhookOutcome> {
        let mut tx = self.pool.begin().await?;

        // Re-read under lock: redeliveries racing each other must observe the
        // first confirmation.
        let current = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE id = $1 FOR UPDATE",
        )
        .bind(payment.id)
        .fetch_one(&mut tx)
        .await?;

        if current.is_confirmed() {
            drop(tx);
            self.append_audit(
                payment,
                ReconciliationStatus::Synced,
                payload,
                Some("duplicate delivery; funds already applied"),
            )
            .await?;
            info!(
                reference_code = %payment.reference_code,
                "webhook redelivery ignored; payment already confirmed"
            );
            return Ok(WebhookOutcome {
                payment_id: payment.id,
                disposition: WebhookDisposition::AlreadyProcessed,
            });
        }

        match BillingLedger::apply_payment_in(&mut tx, payment.billing_id, fields.amount, now).await
        {
            Ok(_billing) => {
                sqlx::query(
                    "UPDATE payments SET status = $2, amount = $3, confirmation_date = $4, \
                     payment_date = COALESCE(payment_date, $4), gateway_response = $5, \
                     updated_at = NOW() WHERE id = $1",
                )
                .bind(payment.id)
                .bind(PaymentStatus::Confirmed.as_str())
                .bind(fields.amount)
                .bind(now)
                .bind(payload)
                .execute(&mut tx)
                .await?;

                Self::insert_reconciliation(
                    &mut tx,
                    payment,
                    ReconciliationStatus::Synced,
                    payload,
                    None,
                )
                .await?;
                tx.commit().await?;

                info!(
                    reference_code = %payment.reference_code,
                    amount = fields.amount,
                    "webhook payment confirmed and applied"
                );
                Ok(WebhookOutcome {
                    payment_id: payment.id,
                    disposition: WebhookDisposition::Applied,
                })
            }
            Err(err) => {
                // roll back the half-applied transaction, then record the
                // failure so the attempt is auditable
                drop(tx);
                let note = err.to_string();
                self.persist_status(payment, PaymentStatus::Failed, payload)
                    .await?;
                self.append_audit(
                    payment,
                    ReconciliationStatus::Failed,
                    payload,
                    Some(&note),
                )
                .await?;
                warn!(
                    reference_code = %payment.reference_code,
                    error = %note,
                    "webhook ledger application failed; payment marked failed"
                );
                Err(err)
            }
        }
    }

    async fn mark_failed(&self, payment: &Payment, payload: &Value) -> AppResult<WebhookOutcome> {
        self.persist_status(payment, PaymentStatus::Failed, payload)
            .await?;
        self.append_audit(payment, ReconciliationStatus::Failed, payload, None)
            .await?;
        info!(reference_code = %payment.reference_code, "webhook reported failure; payment marked failed");
        Ok(WebhookOutcome {
            payment_id: payment.id,
            disposition: WebhookDisposition::MarkedFailed,
        })
    }

    async fn acknowledge_pending(
        &self,
        payment: &Payment,
        payload: &Value,
    ) -> AppResult<WebhookOutcome> {
        self.append_audit(payment, ReconciliationStatus::Pending, payload, None)
            .await?;
        info!(reference_code = %payment.reference_code, "webhook pending; ledger untouched");
        Ok(WebhookOutcome {
            payment_id: payment.id,
            disposition: WebhookDisposition::AcknowledgedPending,
        })
    }

    async fn persist_status(
        &self,
        payment: &Payment,
        status: PaymentStatus,
        payload: &Value,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE payments SET status = $2, gateway_response = $3, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(payment.id)
        .bind(status.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_audit(
        &self,
        payment: &Payment,
        status: ReconciliationStatus,
        payload: &Value,
        notes: Option<&str>,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_reconciliation(&mut tx, payment, status, payload, notes).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_reconciliation(
        tx: &mut Transaction<'_, Postgres>,
        payment: &Payment,
        status: ReconciliationStatus,
        payload: &Value,
        notes: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO payment_reconciliations (payment_id, gateway_name, status, \
             gateway_response, notes) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(payment.id)
        .bind(payment.gateway_name.as_deref().unwrap_or("gateway"))
        .bind(status.as_str())
        .bind(payload)
        .bind(notes)
        .execute(&mut *tx)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "webhook-secret";

    fn payload() -> Value {
        json!({
            "transaction_id": "TXN-2026-001",
            "reference_code": "PAY20260117103000AB12CD",
            "billing_id": 1,
            "student_id": 1,
            "amount": 2_500_000,
            "status": "success",
            "payment_method": "transfer",
        })
    }

    #[test]
    fn canonical_message_sorts_keys_and_drops_signature() {
        let mut signed = payload();
        signed["signature"] = json!("deadbeef");
        let canonical = canonical_message(&signed).unwrap();
        assert!(!canonical.contains("signature"));
        assert_eq!(canonical, canonical_message(&payload()).unwrap());
        // keys surface in sorted order regardless of construction order
        let amount_at = canonical.find("\"amount\"").unwrap();
        let billing_at = canonical.find("\"billing_id\"").unwrap();
        let txn_at = canonical.find("\"transaction_id\"").unwrap();
        assert!(amount_at < billing_at && billing_at < txn_at);
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let mut body = payload();
        let signature = sign_payload(&body, SECRET).unwrap();
        body["signature"] = json!(signature);
        verify_signature(&body, SECRET).unwrap();
    }

    #[test]
    fn missing_signature_is_unauthorized() {
        let err = verify_signature(&payload(), SECRET).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }

    #[test]
    fn tampered_payload_is_unauthorized() {
        let mut body = payload();
        let signature = sign_payload(&body, SECRET).unwrap();
        body["signature"] = json!(signature);
        body["amount"] = json!(9_999_999);
        let err = verify_signature(&body, SECRET).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }

    #[test]
    fn wrong_secret_is_unauthorized() {
        let mut body = payload();
        let signature = sign_payload(&body, "some-other-secret").unwrap();
        body["signature"] = json!(signature);
        let err = verify_signature(&body, SECRET).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }

    #[test]
    fn malformed_signature_hex_is_unauthorized() {
        let mut body = payload();
        body["signature"] = json!("not-hex!!");
        let err = verify_signature(&body, SECRET).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }

    #[test]
    fn field_parsing_reports_every_violation() {
        let raw = parse_fields(&json!({
            "amount": -5,
            "status": "settled",
        }));
        // transaction_id, reference_code, billing_id, student_id missing,
        // amount non-positive, status invalid
        assert_eq!(raw.errors.len(), 6);
        assert!(raw
            .errors
            .iter()
            .any(|e| e == "missing required field: transaction_id"));
        assert!(raw.errors.iter().any(|e| e == "amount must be greater than 0"));
        assert!(raw
            .errors
            .iter()
            .any(|e| e == "status must be one of: success, pending, failed"));
    }

    #[test]
    fn field_parsing_accepts_complete_payload() {
        let raw = parse_fields(&payload());
        assert!(raw.errors.is_empty());
        assert_eq!(raw.billing_id, Some(1));
        assert_eq!(raw.amount, Some(2_500_000));
        assert_eq!(raw.status.as_deref(), Some("success"));
    }

    #[test]
    fn fractional_amount_is_rejected() {
        let mut body = payload();
        body["amount"] = json!(2500.75);
        let raw = parse_fields(&body);
        assert!(raw
            .errors
            .iter()
            .any(|e| e == "missing required field: amount"));
    }
}
