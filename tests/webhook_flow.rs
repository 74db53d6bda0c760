use chrono::{Duration, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;

use spp_backend::billing::reconciliation::{sign_payload, WebhookReconciler};
use spp_backend::billing::WebhookDisposition;
use spp_backend::error::AppError;

const SECRET: &str = "integration-webhook-secret";

struct Fixture {
    student_id: i32,
    billing_id: i64,
    payment_id: i64,
    reference_code: String,
}

/// Seeds one active student with an unpaid 5,000,000 billing and a pending
/// payment of `amount` awaiting gateway confirmation.
async fn seed(pool: &PgPool, amount: i64) -> Fixture {
    let program_id: i32 = sqlx::query_scalar(
        "INSERT INTO study_programs (name, code, tuition_amount) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind("Ilmu Komputer")
    .bind("IK")
    .bind(5_000_000_i64)
    .fetch_one(pool)
    .await
    .unwrap();

    let student_id: i32 = sqlx::query_scalar(
        "INSERT INTO students (nim, name, email, program_id) VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind("2023901")
    .bind("Webhook Student")
    .bind("2023901@kampus.example")
    .bind(program_id)
    .fetch_one(pool)
    .await
    .unwrap();

    let billing_id: i64 = sqlx::query_scalar(
        "INSERT INTO billings (student_id, semester, total_amount, paid_amount, \
         remaining_amount, status, due_date) VALUES ($1, $2, $3, 0, $3, 'unpaid', $4) \
         RETURNING id",
    )
    .bind(student_id)
    .bind("2026/2027-Ganjil")
    .bind(5_000_000_i64)
    .bind(Utc::now() + Duration::days(14))
    .fetch_one(pool)
    .await
    .unwrap();

    let reference_code = format!("PAY20260117103000{billing_id:06}");
    let payment_id: i64 = sqlx::query_scalar(
        "INSERT INTO payments (student_id, billing_id, transaction_id, reference_code, \
         amount, status, gateway_name) VALUES ($1, $2, $3, $4, $5, 'pending', 'midtrans') \
         RETURNING id",
    )
    .bind(student_id)
    .bind(billing_id)
    .bind(format!("TXN-WH-{billing_id}"))
    .bind(&reference_code)
    .bind(amount)
    .fetch_one(pool)
    .await
    .unwrap();

    Fixture {
        student_id,
        billing_id,
        payment_id,
        reference_code,
    }
}

fn signed_payload(fixture: &Fixture, amount: i64, status: &str) -> Value {
    let mut body = json!({
        "transaction_id": format!("TXN-WH-{}", fixture.billing_id),
        "reference_code": fixture.reference_code,
        "billing_id": fixture.billing_id,
        "student_id": fixture.student_id,
        "amount": amount,
        "status": status,
        "payment_method": "transfer",
    });
    let signature = sign_payload(&body, SECRET).unwrap();
    body["signature"] = json!(signature);
    body
}

async fn billing_state(pool: &PgPool, billing_id: i64) -> (i64, i64, String) {
    sqlx::query_as("SELECT paid_amount, remaining_amount, status FROM billings WHERE id = $1")
        .bind(billing_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

// key: webhook-tests -> replay idempotency, signature gate, audit trail
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn success_webhook_applies_funds_exactly_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let fixture = seed(&pool, 2_500_000).await;
    let reconciler = WebhookReconciler::new(pool.clone(), SECRET);

    let payload = signed_payload(&fixture, 2_500_000, "success");
    let outcome = reconciler.handle(payload.clone(), Utc::now()).await.unwrap();
    assert_eq!(outcome.payment_id, fixture.payment_id);
    assert_eq!(outcome.disposition, WebhookDisposition::Applied);

    let (paid, remaining, status) = billing_state(&pool, fixture.billing_id).await;
    assert_eq!(paid, 2_500_000);
    assert_eq!(remaining, 2_500_000);
    assert_eq!(status, "partial");

    // exact redelivery: acknowledged, funds untouched
    let replay = reconciler.handle(payload, Utc::now()).await.unwrap();
    assert_eq!(replay.disposition, WebhookDisposition::AlreadyProcessed);

    let (paid, remaining, _) = billing_state(&pool, fixture.billing_id).await;
    assert_eq!(paid, 2_500_000);
    assert_eq!(remaining, 2_500_000);

    // still exactly one payment, and both attempts are in the audit trail
    let payments: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payments")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(payments, 1);
    let audits: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM payment_reconciliations WHERE payment_id = $1",
    )
    .bind(fixture.payment_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(audits, 2);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn invalid_signature_never_mutates(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let fixture = seed(&pool, 2_500_000).await;
    let reconciler = WebhookReconciler::new(pool.clone(), SECRET);

    let mut payload = signed_payload(&fixture, 2_500_000, "success");
    payload["amount"] = json!(4_000_000);
    let err = reconciler.handle(payload, Utc::now()).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized));

    let (paid, _, status) = billing_state(&pool, fixture.billing_id).await;
    assert_eq!(paid, 0);
    assert_eq!(status, "unpaid");
    let payment_status: String =
        sqlx::query_scalar("SELECT status FROM payments WHERE id = $1")
            .bind(fixture.payment_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(payment_status, "pending");
    let audits: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payment_reconciliations")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(audits, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn failed_webhook_marks_payment_failed(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let fixture = seed(&pool, 2_500_000).await;
    let reconciler = WebhookReconciler::new(pool.clone(), SECRET);

    let payload = signed_payload(&fixture, 2_500_000, "failed");
    let outcome = reconciler.handle(payload, Utc::now()).await.unwrap();
    assert_eq!(outcome.disposition, WebhookDisposition::MarkedFailed);

    let payment_status: String =
        sqlx::query_scalar("SELECT status FROM payments WHERE id = $1")
            .bind(fixture.payment_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(payment_status, "failed");

    let (paid, _, status) = billing_state(&pool, fixture.billing_id).await;
    assert_eq!(paid, 0);
    assert_eq!(status, "unpaid");

    let audit_status: String = sqlx::query_scalar(
        "SELECT status FROM payment_reconciliations WHERE payment_id = $1",
    )
    .bind(fixture.payment_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(audit_status, "failed");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn pending_webhook_is_acknowledged_without_apply(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let fixture = seed(&pool, 2_500_000).await;
    let reconciler = WebhookReconciler::new(pool.clone(), SECRET);

    let payload = signed_payload(&fixture, 2_500_000, "pending");
    let outcome = reconciler.handle(payload, Utc::now()).await.unwrap();
    assert_eq!(outcome.disposition, WebhookDisposition::AcknowledgedPending);

    let payment_status: String =
        sqlx::query_scalar("SELECT status FROM payments WHERE id = $1")
            .bind(fixture.payment_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(payment_status, "pending");
    let (paid, _, _) = billing_state(&pool, fixture.billing_id).await;
    assert_eq!(paid, 0);

    let audit_status: String = sqlx::query_scalar(
        "SELECT status FROM payment_reconciliations WHERE payment_id = $1",
    )
    .bind(fixture.payment_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(audit_status, "pending");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn unknown_reference_code_is_not_found(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let fixture = seed(&pool, 2_500_000).await;
    let reconciler = WebhookReconciler::new(pool.clone(), SECRET);

    let mut body = json!({
        "transaction_id": "TXN-GHOST",
        "reference_code": "PAY20260101000000FFFFFF",
        "billing_id": fixture.billing_id,
        "student_id": fixture.student_id,
        "amount": 1_000_000,
        "status": "success",
    });
    let signature = sign_payload(&body, SECRET).unwrap();
    body["signature"] = json!(signature);

    let err = reconciler.handle(body, Utc::now()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound("payment")));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn validation_errors_are_itemized(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let reconciler = WebhookReconciler::new(pool.clone(), SECRET);

    // signed, but missing transaction_id, negative amount, bad status and a
    // dangling billing reference
    let mut body = json!({
        "reference_code": "PAY20260101000000AAAAAA",
        "billing_id": 777777,
        "student_id": 1,
        "amount": -10,
        "status": "settled",
    });
    let signature = sign_payload(&body, SECRET).unwrap();
    body["signature"] = json!(signature);

    let err = reconciler.handle(body, Utc::now()).await.unwrap_err();
    match err {
        AppError::Validation(details) => {
            assert!(details.iter().any(|d| d.contains("transaction_id")));
            assert!(details.iter().any(|d| d.contains("amount")));
            assert!(details.iter().any(|d| d.contains("status")));
            assert!(details.iter().any(|d| d.contains("billing 777777 not found")));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn overpaying_webhook_marks_payment_failed_and_surfaces(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let fixture = seed(&pool, 9_000_000).await;
    let reconciler = WebhookReconciler::new(pool.clone(), SECRET);

    // gateway settles more than the billing's remaining amount
    let payload = signed_payload(&fixture, 9_000_000, "success");
    let err = reconciler.handle(payload, Utc::now()).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let payment_status: String =
        sqlx::query_scalar("SELECT status FROM payments WHERE id = $1")
            .bind(fixture.payment_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(payment_status, "failed");

    let (paid, _, _) = billing_state(&pool, fixture.billing_id).await;
    assert_eq!(paid, 0);

    let audit_status: String = sqlx::query_scalar(
        "SELECT status FROM payment_reconciliations WHERE payment_id = $1",
    )
    .bind(fixture.payment_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(audit_status, "failed");
}
