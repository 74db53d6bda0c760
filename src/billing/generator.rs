use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};

use super::models::{BillingStatus, Semester};

/// key: billing-generator -> one billing per active student per semester
#[derive(Clone)]
pub struct BillingGenerator {
    pool: PgPool,
}

#[derive(Debug, Default, Serialize)]
pub struct GenerationReport {
    pub created: u32,
    pub skipped: u32,
    pub failed: u32,
}

#[derive(Debug, FromRow)]
struct BillableStudent {
    id: i32,
    nim: String,
    tuition_amount: i64,
}

impl BillingGenerator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn fetch_semester(&self, semester_id: i32) -> AppResult<Semester> {
        sqlx::query_as::<_, Semester>("SELECT * FROM semesters WHERE id = $1")
            .bind(semester_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound("semester"))
    }

    /// Creates one Unpaid billing per active student for the semester. A
    /// student who already has a billing for it is skipped, not an error.
    /// Each insert commits independently; per-student failures are counted
    /// and logged without aborting the batch.
    pub async fn generate_for_semester(
        &self,
        semester_id: i32,
        due_days: i64,
        now: DateTime<Utc>,
    ) -> AppResult<GenerationReport> {
        let semester = self.fetch_semester(semester_id).await?;

        // the program fee is fetched explicitly alongside each student
        let students = sqlx::query_as::<_, BillableStudent>(
            "SELECT s.id, s.nim, p.tuition_amount FROM students s \
             JOIN study_programs p ON p.id = s.program_id \
             WHERE s.status = 'active' ORDER BY s.id",
        )
        .fetch_all(&self.pool)
        .await?;

        let due_date = now + Duration::days(due_days);
        let mut report = GenerationReport::default();

        for student in students {
            // ON CONFLICT DO NOTHING keeps the (student, semester) uniqueness
            // race-safe against a concurrent generation run
            let inserted = sqlx::query(
                "INSERT INTO billings (student_id, semester, total_amount, paid_amount, \
                 remaining_amount, status, due_date) VALUES ($1, $2, $3, 0, $3, $4, $5) \
                 ON CONFLICT (student_id, semester) DO NOTHING",
            )
            .bind(student.id)
            .bind(&semester.name)
            .bind(student.tuition_amount)
            .bind(BillingStatus::Unpaid.as_str())
            .bind(due_date)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(result) if result.rows_affected() == 0 => report.skipped += 1,
                Ok(_) => report.created += 1,
                Err(err) => {
                    warn!(?err, nim = %student.nim, "failed to create billing");
                    report.failed += 1;
                }
            }
        }

        info!(
            semester = %semester.name,
            created = report.created,
            skipped = report.skipped,
            failed = report.failed,
            "billing generation finished"
        );
        Ok(report)
    }

    /// Stamps the semester as generated so the scheduled job runs at most
    /// once per semester.
    pub async fn mark_generated(&self, semester_id: i32, now: DateTime<Utc>) -> AppResult<()> {
        sqlx::query("UPDATE semesters SET billing_generation_date = $2 WHERE id = $1")
            .bind(semester_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
