use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgPool};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};

use crate::config::BillingConfig;

use super::generator::BillingGenerator;
use super::ledger::{self, BillingLedger};
use super::models::{Billing, Semester};

/// key: billing-scheduler -> periodic penalty/generation/reminder automation
///
/// The registry is owned by the composition root: `spawn` starts one timer
/// loop per job, and every tick takes an explicit `now` so the jobs stay
/// testable against a fixed clock.
pub fn spawn(pool: PgPool, config: BillingConfig) {
    {
        let pool = pool.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let mut ticker =
                time::interval(TokioDuration::from_secs(config.penalty_scan_interval_secs));
            loop {
                ticker.tick().await;
                if let Err(err) =
                    penalty_tick(&pool, Utc::now(), config.penalty_per_day, config.max_penalty)
                        .await
                {
                    warn!(?err, "penalty update tick failed");
                }
            }
        });
    }

    {
        let pool = pool.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let mut ticker =
                time::interval(TokioDuration::from_secs(config.generation_scan_interval_secs));
            loop {
                ticker.tick().await;
                if let Err(err) = generation_tick(&pool, Utc::now(), config.due_days_default).await
                {
                    warn!(?err, "billing generation tick failed");
                }
            }
        });
    }

    tokio::spawn(async move {
        let mut ticker =
            time::interval(TokioDuration::from_secs(config.reminder_scan_interval_secs));
        loop {
            ticker.tick().await;
            if let Err(err) = reminder_tick(&pool, Utc::now()).await {
                warn!(?err, "payment reminder tick failed");
            }
        }
    });
}

#[derive(Debug, Default)]
pub struct PenaltyTickReport {
    pub scanned: u32,
    pub updated: u32,
    pub failed: u32,
}

#[derive(Debug, FromRow)]
struct PenaltyCandidate {
    id: i64,
}

/// Recomputes the penalty for every collectible billing. Per-item failures
/// are isolated; unchanged billings are not rewritten.
pub async fn penalty_tick(
    pool: &PgPool,
    now: DateTime<Utc>,
    per_day_rate: i64,
    max_penalty: i64,
) -> Result<PenaltyTickReport> {
    let candidates = sqlx::query_as::<_, PenaltyCandidate>(
        "SELECT id FROM billings WHERE status IN ('unpaid', 'partial', 'overdue') ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    let ledger = BillingLedger::new(pool.clone());
    let mut report = PenaltyTickReport {
        scanned: candidates.len() as u32,
        ..Default::default()
    };

    for candidate in candidates {
        match ledger
            .update_penalty(candidate.id, per_day_rate, max_penalty, now)
            .await
        {
            Ok((_, true)) => report.updated += 1,
            Ok((_, false)) => {}
            Err(err) => {
                warn!(?err, billing_id = candidate.id, "penalty update failed");
                report.failed += 1;
            }
        }
    }

    if report.updated > 0 || report.failed > 0 {
        info!(
            scanned = report.scanned,
            updated = report.updated,
            failed = report.failed,
            "penalty update tick finished"
        );
    } else {
        debug!(scanned = report.scanned, "no penalty movement");
    }
    Ok(report)
}

/// Runs the billing generator once per semester: picks the active semester
/// that has not been generated yet, creates the billings, and stamps it.
pub async fn generation_tick(
    pool: &PgPool,
    now: DateTime<Utc>,
    due_days: i64,
) -> Result<Option<super::generator::GenerationReport>> {
    let semester = sqlx::query_as::<_, Semester>(
        "SELECT * FROM semesters WHERE is_active = TRUE ORDER BY start_date DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    let Some(semester) = semester else {
        debug!("no active semester; skipping billing generation");
        return Ok(None);
    };
    if semester.billing_generation_date.is_some() {
        debug!(semester = %semester.name, "billing already generated");
        return Ok(None);
    }

    let generator = BillingGenerator::new(pool.clone());
    let report = generator
        .generate_for_semester(semester.id, due_days, now)
        .await?;
    generator.mark_generated(semester.id, now).await?;
    info!(semester = %semester.name, created = report.created, "scheduled billing generation finished");
    Ok(Some(report))
}

/// Collects billings due within the next 7 days plus everything already
/// overdue. Delivery is an external concern; the tick reports the batch.
pub async fn reminder_tick(pool: &PgPool, now: DateTime<Utc>) -> Result<usize> {
    let upcoming = sqlx::query_as::<_, Billing>(
        "SELECT * FROM billings WHERE status != 'paid' \
         AND due_date >= $1 AND due_date <= $2",
    )
    .bind(now)
    .bind(now + Duration::days(7))
    .fetch_all(pool)
    .await?;

    let overdue = sqlx::query_as::<_, Billing>(
        "SELECT * FROM billings WHERE status = 'overdue'",
    )
    .fetch_all(pool)
    .await?;

    let total = upcoming.len() + overdue.len();
    for billing in upcoming.iter().chain(overdue.iter()) {
        debug!(
            billing_id = billing.id,
            student_id = billing.student_id,
            outstanding = ledger::outstanding_amount(billing),
            due_date = %billing.due_date,
            "payment reminder queued"
        );
    }
    info!(reminders = total, "payment reminder tick finished");
    Ok(total)
}
