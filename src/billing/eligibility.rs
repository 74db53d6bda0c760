use serde::Serialize;
use sqlx::{FromRow, PgPool};

use crate::error::{AppError, AppResult};

use super::models::Billing;

/// key: eligibility-gate -> KRS registration gating on outstanding debt
///
/// Read-only: every answer reflects the ledger as stored, never a cache.
#[derive(Clone)]
pub struct EligibilityGate {
    pool: PgPool,
}

#[derive(Debug, Serialize)]
pub struct Eligibility {
    pub can_register: bool,
    pub outstanding: i64,
}

#[derive(Debug, Serialize)]
pub struct BillingSummary {
    pub student_id: i32,
    pub nim: String,
    pub name: String,
    pub program: String,
    pub total_billed: i64,
    pub total_paid: i64,
    pub total_outstanding: i64,
    pub billings: Vec<Billing>,
}

#[derive(Debug, Serialize)]
pub struct EligibilityReportRow {
    pub student_id: i32,
    pub nim: String,
    pub name: String,
    pub program: String,
    pub eligible_for_krs: bool,
    pub outstanding: i64,
}

#[derive(Debug, Serialize)]
pub struct EligibilityReport {
    pub total_students: i64,
    pub eligible_for_krs: i64,
    pub blocked_from_krs: i64,
    pub total_blocked_arrears: i64,
    pub students: Vec<EligibilityReportRow>,
}

#[derive(Debug, FromRow)]
struct StudentOutstandingRow {
    id: i32,
    nim: String,
    name: String,
    program: String,
    outstanding: i64,
}

impl EligibilityGate {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn can_register(&self, student_id: i32) -> AppResult<Eligibility> {
        let exists: Option<i32> = sqlx::query_scalar("SELECT id FROM students WHERE id = $1")
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(AppError::NotFound("student"));
        }

        let outstanding: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(remaining_amount), 0)::BIGINT FROM billings \
             WHERE student_id = $1 AND status IN ('unpaid', 'partial', 'overdue')",
        )
        .bind(student_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Eligibility {
            can_register: outstanding == 0,
            outstanding,
        })
    }

    pub async fn billing_summary(&self, student_id: i32) -> AppResult<BillingSummary> {
        let student: Option<(i32, String, String, String)> = sqlx::query_as(
            "SELECT s.id, s.nim, s.name, p.name FROM students s \
             JOIN study_programs p ON p.id = s.program_id WHERE s.id = $1",
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;
        let (id, nim, name, program) = student.ok_or(AppError::NotFound("student"))?;

        let billings = sqlx::query_as::<_, Billing>(
            "SELECT * FROM billings WHERE student_id = $1 ORDER BY created_at",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;

        let total_billed = billings.iter().map(|b| b.total_amount).sum();
        let total_paid = billings.iter().map(|b| b.paid_amount).sum();
        let total_outstanding = billings
            .iter()
            .map(super::ledger::outstanding_amount)
            .sum();

        Ok(BillingSummary {
            student_id: id,
            nim,
            name,
            program,
            total_billed,
            total_paid,
            total_outstanding,
            billings,
        })
    }

    /// Eligibility across every active student, computed at call time.
    pub async fn report(&self) -> AppResult<EligibilityReport> {
        let rows = sqlx::query_as::<_, StudentOutstandingRow>(
            "SELECT s.id, s.nim, s.name, p.name AS program, \
             COALESCE((SELECT SUM(b.remaining_amount) FROM billings b \
                       WHERE b.student_id = s.id \
                       AND b.status IN ('unpaid', 'partial', 'overdue')), 0)::BIGINT \
             AS outstanding \
             FROM students s JOIN study_programs p ON p.id = s.program_id \
             WHERE s.status = 'active' ORDER BY s.id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut report = EligibilityReport {
            total_students: rows.len() as i64,
            eligible_for_krs: 0,
            blocked_from_krs: 0,
            total_blocked_arrears: 0,
            students: Vec::with_capacity(rows.len()),
        };
        for row in rows {
            let eligible = row.outstanding == 0;
            if eligible {
                report.eligible_for_krs += 1;
            } else {
                report.blocked_from_krs += 1;
                report.total_blocked_arrears += row.outstanding;
            }
            report.students.push(EligibilityReportRow {
                student_id: row.id,
                nim: row.nim,
                name: row.name,
                program: row.program,
                eligible_for_krs: eligible,
                outstanding: row.outstanding,
            });
        }
        Ok(report)
    }
}
