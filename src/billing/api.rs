use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};

use super::eligibility::EligibilityGate;
use super::generator::BillingGenerator;
use super::ledger::BillingLedger;
use super::models::{Billing, Payment, Semester};
use super::payments::PaymentProcessor;

/// key: billing-api -> rest endpoints over the ledger services
pub async fn process_payment(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<ProcessPaymentRequest>,
) -> AppResult<impl IntoResponse> {
    let processor = PaymentProcessor::new(pool);
    let result = processor
        .process(
            payload.billing_id,
            payload.amount,
            Some(payload.payment_method_id),
            &payload.transaction_id,
            payload.gateway_name.as_deref().unwrap_or("manual"),
            Utc::now(),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ProcessPaymentResponse {
            payment: PaymentSummary::from(&result.payment),
            billing: BillingSnapshot::from(&result.billing),
        }),
    ))
}

pub async fn payment_detail(
    Extension(pool): Extension<PgPool>,
    Path(payment_id): Path<i64>,
) -> AppResult<Json<PaymentDetailResponse>> {
    let processor = PaymentProcessor::new(pool.clone());
    let payment = processor.detail(payment_id).await?;

    let student: (i32, String, String) =
        sqlx::query_as("SELECT id, nim, name FROM students WHERE id = $1")
            .bind(payment.student_id)
            .fetch_one(&pool)
            .await?;
    let billing: (i64, String, String) =
        sqlx::query_as("SELECT id, semester, status FROM billings WHERE id = $1")
            .bind(payment.billing_id)
            .fetch_one(&pool)
            .await?;

    Ok(Json(PaymentDetailResponse {
        payment,
        student: StudentRef {
            id: student.0,
            nim: student.1,
            name: student.2,
        },
        billing: BillingRef {
            id: billing.0,
            semester: billing.1,
            status: billing.2,
        },
    }))
}

pub async fn payment_history(
    Extension(pool): Extension<PgPool>,
    Path(student_id): Path<i32>,
    Query(params): Query<HistoryParams>,
) -> AppResult<Json<PaymentHistoryResponse>> {
    let processor = PaymentProcessor::new(pool);
    let payments = processor.history(student_id, params.limit).await?;
    Ok(Json(PaymentHistoryResponse {
        total: payments.len(),
        payments,
    }))
}

pub async fn payment_statistics(
    Extension(pool): Extension<PgPool>,
    Query(params): Query<StatisticsParams>,
) -> AppResult<Json<PaymentStatisticsResponse>> {
    let end = Utc::now();
    let start = end - Duration::days(params.days);
    let processor = PaymentProcessor::new(pool);
    let statistics = processor.statistics(start, end).await?;
    Ok(Json(PaymentStatisticsResponse {
        start_date: start,
        end_date: end,
        days: params.days,
        total_payments: statistics.total_payments,
        total_amount: statistics.total_amount,
        average_amount: statistics.average_amount,
    }))
}

pub async fn generate_billing(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<AppConfig>,
    Path(semester_id): Path<i32>,
    payload: Option<Json<GenerateBillingRequest>>,
) -> AppResult<Json<GenerateBillingResponse>> {
    let due_days = payload
        .and_then(|Json(body)| body.due_days)
        .unwrap_or(config.billing.due_days_default);
    if due_days <= 0 {
        return Err(AppError::Validation(vec![
            "due_days must be greater than 0".to_string(),
        ]));
    }

    let generator = BillingGenerator::new(pool);
    let report = generator
        .generate_for_semester(semester_id, due_days, Utc::now())
        .await?;
    Ok(Json(GenerateBillingResponse {
        created_count: report.created,
        skipped_count: report.skipped,
        failed_count: report.failed,
    }))
}

pub async fn billing_summary(
    Extension(pool): Extension<PgPool>,
    Path(student_id): Path<i32>,
) -> AppResult<Json<BillingSummaryResponse>> {
    let gate = EligibilityGate::new(pool);
    let summary = gate.billing_summary(student_id).await?;
    let now = Utc::now();

    let payment_percentage = if summary.total_billed > 0 {
        summary.total_paid as f64 / summary.total_billed as f64 * 100.0
    } else {
        0.0
    };
    let billings = summary
        .billings
        .iter()
        .map(|b| BillingDetail {
            days_overdue: b.days_overdue(now),
            billing: b.clone(),
        })
        .collect();

    Ok(Json(BillingSummaryResponse {
        student: StudentRef {
            id: summary.student_id,
            nim: summary.nim.clone(),
            name: summary.name.clone(),
        },
        program: summary.program.clone(),
        total_billed: summary.total_billed,
        total_paid: summary.total_paid,
        total_outstanding: summary.total_outstanding,
        payment_percentage,
        billings,
    }))
}

pub async fn can_register(
    Extension(pool): Extension<PgPool>,
    Path(student_id): Path<i32>,
) -> AppResult<Response> {
    let gate = EligibilityGate::new(pool);
    let eligibility = gate.can_register(student_id).await?;

    let status = if eligibility.can_register {
        StatusCode::OK
    } else {
        StatusCode::FORBIDDEN
    };
    let message = if eligibility.can_register {
        "student may register for KRS".to_string()
    } else {
        format!(
            "student has an outstanding balance of {}",
            eligibility.outstanding
        )
    };
    Ok((
        status,
        Json(CanRegisterResponse {
            can_register: eligibility.can_register,
            outstanding: eligibility.outstanding,
            message,
        }),
    )
        .into_response())
}

pub async fn eligibility_report(
    Extension(pool): Extension<PgPool>,
    Query(params): Query<ReportParams>,
) -> AppResult<Json<EligibilityReportResponse>> {
    if !matches!(params.eligible.as_str(), "all" | "eligible" | "not_eligible") {
        return Err(AppError::Validation(vec![
            "eligible must be one of: all, eligible, not_eligible".to_string(),
        ]));
    }

    let gate = EligibilityGate::new(pool);
    let report = gate.report().await?;

    let filtered: Vec<_> = report
        .students
        .into_iter()
        .filter(|row| match params.eligible.as_str() {
            "eligible" => row.eligible_for_krs,
            "not_eligible" => !row.eligible_for_krs,
            _ => true,
        })
        .collect();
    let total_filtered = filtered.len();
    let page = filtered
        .into_iter()
        .skip(params.offset)
        .take(params.limit)
        .collect();

    Ok(Json(EligibilityReportResponse {
        generated_at: Utc::now(),
        filter: params.eligible,
        total_students: report.total_students,
        eligible_for_krs: report.eligible_for_krs,
        blocked_from_krs: report.blocked_from_krs,
        total_blocked_arrears: report.total_blocked_arrears,
        offset: params.offset,
        limit: params.limit,
        total: total_filtered,
        students: page,
    }))
}

pub async fn update_penalty(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<AppConfig>,
    Path(billing_id): Path<i64>,
) -> AppResult<Json<UpdatePenaltyResponse>> {
    let ledger = BillingLedger::new(pool);
    let (billing, changed) = ledger
        .update_penalty(
            billing_id,
            config.billing.penalty_per_day,
            config.billing.max_penalty,
            Utc::now(),
        )
        .await?;
    Ok(Json(UpdatePenaltyResponse {
        penalty: billing.penalty,
        changed,
        billing: BillingSnapshot::from(&billing),
    }))
}

pub async fn list_outstanding(
    Extension(pool): Extension<PgPool>,
    Query(params): Query<OutstandingParams>,
) -> AppResult<Json<OutstandingResponse>> {
    if let Some(status) = &params.status {
        if !matches!(status.as_str(), "unpaid" | "partial" | "overdue") {
            return Err(AppError::Validation(vec![
                "status must be one of: unpaid, partial, overdue".to_string(),
            ]));
        }
    }

    let total: i64 = match &params.status {
        Some(status) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM billings WHERE status = $1")
                .bind(status)
                .fetch_one(&pool)
                .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM billings WHERE status != 'paid'")
                .fetch_one(&pool)
                .await?
        }
    };

    let rows: Vec<OutstandingRow> = match &params.status {
        Some(status) => {
            sqlx::query_as(
                "SELECT b.id, s.nim, s.name, b.semester, b.total_amount, b.remaining_amount, \
                 b.penalty, b.status, b.due_date FROM billings b \
                 JOIN students s ON s.id = b.student_id WHERE b.status = $1 \
                 ORDER BY b.created_at DESC LIMIT $2 OFFSET $3",
            )
            .bind(status)
            .bind(params.limit)
            .bind(params.offset)
            .fetch_all(&pool)
            .await?
        }
        None => {
            sqlx::query_as(
                "SELECT b.id, s.nim, s.name, b.semester, b.total_amount, b.remaining_amount, \
                 b.penalty, b.status, b.due_date FROM billings b \
                 JOIN students s ON s.id = b.student_id WHERE b.status != 'paid' \
                 ORDER BY b.created_at DESC LIMIT $2 OFFSET $3",
            )
            .bind(params.limit)
            .bind(params.offset)
            .fetch_all(&pool)
            .await?
        }
    };

    Ok(Json(OutstandingResponse {
        total,
        limit: params.limit,
        offset: params.offset,
        billings: rows,
    }))
}

/// Operator escape hatch; payments and audit rows cascade with the billing.
pub async fn delete_billing(
    Extension(pool): Extension<PgPool>,
    Path(billing_id): Path<i64>,
) -> AppResult<Json<DeleteBillingResponse>> {
    let ledger = BillingLedger::new(pool.clone());
    let billing = ledger.fetch(billing_id).await?;

    sqlx::query("DELETE FROM billings WHERE id = $1")
        .bind(billing_id)
        .execute(&pool)
        .await?;
    tracing::info!(billing_id, student_id = billing.student_id, "billing purged");

    Ok(Json(DeleteBillingResponse {
        deleted_billing: BillingSnapshot::from(&billing),
    }))
}

pub async fn list_semesters(
    Extension(pool): Extension<PgPool>,
) -> AppResult<Json<SemestersResponse>> {
    let semesters = sqlx::query_as::<_, Semester>("SELECT * FROM semesters ORDER BY start_date")
        .fetch_all(&pool)
        .await?;
    Ok(Json(SemestersResponse { semesters }))
}

pub async fn create_semester(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<CreateSemesterRequest>,
) -> AppResult<impl IntoResponse> {
    let mut errors = Vec::new();
    if payload.name.trim().is_empty() {
        errors.push("name must not be empty".to_string());
    }
    if payload.end_date <= payload.start_date {
        errors.push("end_date must be after start_date".to_string());
    }
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    let semester = sqlx::query_as::<_, Semester>(
        "INSERT INTO semesters (name, start_date, end_date, is_active) \
         VALUES ($1, $2, $3, $4) RETURNING *",
    )
    .bind(payload.name.trim())
    .bind(payload.start_date)
    .bind(payload.end_date)
    .bind(payload.is_active)
    .fetch_one(&pool)
    .await
    .map_err(|e| AppError::conflict_on_unique(e, "semester name already exists"))?;

    Ok((StatusCode::CREATED, Json(semester)))
}

#[derive(Debug, Deserialize)]
pub struct ProcessPaymentRequest {
    pub billing_id: i64,
    pub amount: i64,
    pub payment_method_id: i32,
    pub transaction_id: String,
    #[serde(default)]
    pub gateway_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PaymentSummary {
    pub id: i64,
    pub reference_code: String,
    pub amount: i64,
    pub status: String,
}

impl From<&Payment> for PaymentSummary {
    fn from(payment: &Payment) -> Self {
        Self {
            id: payment.id,
            reference_code: payment.reference_code.clone(),
            amount: payment.amount,
            status: payment.status.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BillingSnapshot {
    pub id: i64,
    pub status: String,
    pub total_amount: i64,
    pub paid_amount: i64,
    pub remaining_amount: i64,
    pub penalty: i64,
}

impl From<&Billing> for BillingSnapshot {
    fn from(billing: &Billing) -> Self {
        Self {
            id: billing.id,
            status: billing.status.clone(),
            total_amount: billing.total_amount,
            paid_amount: billing.paid_amount,
            remaining_amount: billing.remaining_amount,
            penalty: billing.penalty,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProcessPaymentResponse {
    pub payment: PaymentSummary,
    pub billing: BillingSnapshot,
}

#[derive(Debug, Serialize)]
pub struct StudentRef {
    pub id: i32,
    pub nim: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct BillingRef {
    pub id: i64,
    pub semester: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentDetailResponse {
    pub payment: Payment,
    pub student: StudentRef,
    pub billing: BillingRef,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

fn default_history_limit() -> i64 {
    10
}

#[derive(Debug, Serialize)]
pub struct PaymentHistoryResponse {
    pub total: usize,
    pub payments: Vec<Payment>,
}

#[derive(Debug, Deserialize)]
pub struct StatisticsParams {
    #[serde(default = "default_statistics_days")]
    pub days: i64,
}

fn default_statistics_days() -> i64 {
    30
}

#[derive(Debug, Serialize)]
pub struct PaymentStatisticsResponse {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub days: i64,
    pub total_payments: i64,
    pub total_amount: i64,
    pub average_amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct GenerateBillingRequest {
    #[serde(default)]
    pub due_days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct GenerateBillingResponse {
    pub created_count: u32,
    pub skipped_count: u32,
    pub failed_count: u32,
}

#[derive(Debug, Serialize)]
pub struct BillingDetail {
    #[serde(flatten)]
    pub billing: Billing,
    pub days_overdue: i64,
}

#[derive(Debug, Serialize)]
pub struct BillingSummaryResponse {
    pub student: StudentRef,
    pub program: String,
    pub total_billed: i64,
    pub total_paid: i64,
    pub total_outstanding: i64,
    pub payment_percentage: f64,
    pub billings: Vec<BillingDetail>,
}

#[derive(Debug, Serialize)]
pub struct CanRegisterResponse {
    pub can_register: bool,
    pub outstanding: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ReportParams {
    #[serde(default = "default_report_filter")]
    pub eligible: String,
    #[serde(default = "default_report_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_report_filter() -> String {
    "all".to_string()
}

fn default_report_limit() -> usize {
    100
}

#[derive(Debug, Serialize)]
pub struct EligibilityReportResponse {
    pub generated_at: DateTime<Utc>,
    pub filter: String,
    pub total_students: i64,
    pub eligible_for_krs: i64,
    pub blocked_from_krs: i64,
    pub total_blocked_arrears: i64,
    pub offset: usize,
    pub limit: usize,
    pub total: usize,
    pub students: Vec<super::eligibility::EligibilityReportRow>,
}

#[derive(Debug, Serialize)]
pub struct UpdatePenaltyResponse {
    pub penalty: i64,
    pub changed: bool,
    pub billing: BillingSnapshot,
}

#[derive(Debug, Deserialize)]
pub struct OutstandingParams {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_outstanding_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_outstanding_limit() -> i64 {
    20
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct OutstandingRow {
    pub id: i64,
    pub nim: String,
    pub name: String,
    pub semester: String,
    pub total_amount: i64,
    pub remaining_amount: i64,
    pub penalty: i64,
    pub status: String,
    pub due_date: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct OutstandingResponse {
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub billings: Vec<OutstandingRow>,
}

#[derive(Debug, Serialize)]
pub struct DeleteBillingResponse {
    pub deleted_billing: BillingSnapshot,
}

#[derive(Debug, Serialize)]
pub struct SemestersResponse {
    pub semesters: Vec<Semester>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSemesterRequest {
    pub name: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub is_active: bool,
}
