use chrono::{Duration, Utc};
use sqlx::PgPool;

use spp_backend::billing::scheduler;

async fn seed_overdue_billing(pool: &PgPool, nim: &str, days_overdue: i64) -> i64 {
    let program_id: i32 = sqlx::query_scalar(
        "INSERT INTO study_programs (name, code, tuition_amount) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind("Teknik Elektro")
    .bind("TE")
    .bind(5_000_000_i64)
    .fetch_one(pool)
    .await
    .unwrap();

    let student_id: i32 = sqlx::query_scalar(
        "INSERT INTO students (nim, name, email, program_id) VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(nim)
    .bind(format!("Student {nim}"))
    .bind(format!("{nim}@kampus.example"))
    .bind(program_id)
    .fetch_one(pool)
    .await
    .unwrap();

    sqlx::query_scalar(
        "INSERT INTO billings (student_id, semester, total_amount, paid_amount, \
         remaining_amount, status, due_date) VALUES ($1, $2, $3, 0, $3, 'unpaid', $4) \
         RETURNING id",
    )
    .bind(student_id)
    .bind("2026/2027-Ganjil")
    .bind(5_000_000_i64)
    .bind(Utc::now() - Duration::days(days_overdue))
    .fetch_one(pool)
    .await
    .unwrap()
}

// key: scheduler-tests -> penalty accrual, one-shot generation, reminders
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn penalty_tick_accrues_and_flags_overdue(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let billing_id = seed_overdue_billing(&pool, "2024101", 5).await;

    let now = Utc::now();
    let report = scheduler::penalty_tick(&pool, now, 10_000, 500_000)
        .await
        .unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.failed, 0);

    let (penalty, status): (i64, String) =
        sqlx::query_as("SELECT penalty, status FROM billings WHERE id = $1")
            .bind(billing_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(penalty, 50_000);
    assert_eq!(status, "overdue");

    // same clock: nothing moves, nothing is rewritten
    let repeat = scheduler::penalty_tick(&pool, now, 10_000, 500_000)
        .await
        .unwrap();
    assert_eq!(repeat.updated, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn penalty_tick_caps_at_max(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let billing_id = seed_overdue_billing(&pool, "2024102", 60).await;

    scheduler::penalty_tick(&pool, Utc::now(), 10_000, 500_000)
        .await
        .unwrap();

    let penalty: i64 = sqlx::query_scalar("SELECT penalty FROM billings WHERE id = $1")
        .bind(billing_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(penalty, 500_000);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn generation_tick_runs_once_per_semester(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let program_id: i32 = sqlx::query_scalar(
        "INSERT INTO study_programs (name, code, tuition_amount) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind("Arsitektur")
    .bind("ARS")
    .bind(4_800_000_i64)
    .fetch_one(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO students (nim, name, email, program_id) VALUES ($1, $2, $3, $4)",
    )
    .bind("2024201")
    .bind("Gen Student")
    .bind("2024201@kampus.example")
    .bind(program_id)
    .execute(&pool)
    .await
    .unwrap();

    let now = Utc::now();
    let semester_id: i32 = sqlx::query_scalar(
        "INSERT INTO semesters (name, start_date, end_date, is_active) \
         VALUES ($1, $2, $3, TRUE) RETURNING id",
    )
    .bind("2026/2027-Ganjil")
    .bind(now - Duration::days(1))
    .bind(now + Duration::days(120))
    .fetch_one(&pool)
    .await
    .unwrap();

    let first = scheduler::generation_tick(&pool, now, 14).await.unwrap();
    let report = first.expect("active semester should generate");
    assert_eq!(report.created, 1);

    let stamped: Option<chrono::DateTime<Utc>> = sqlx::query_scalar(
        "SELECT billing_generation_date FROM semesters WHERE id = $1",
    )
    .bind(semester_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(stamped.is_some());

    // second tick is a no-op
    let second = scheduler::generation_tick(&pool, now, 14).await.unwrap();
    assert!(second.is_none());
    let billings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM billings")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(billings, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn reminder_tick_collects_upcoming_and_overdue(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    // overdue billing, flagged by a prior penalty run
    seed_overdue_billing(&pool, "2024301", 3).await;
    scheduler::penalty_tick(&pool, Utc::now(), 10_000, 500_000)
        .await
        .unwrap();

    // billing due in 3 days
    let student_id: i32 = sqlx::query_scalar(
        "INSERT INTO students (nim, name, email, program_id) \
         SELECT '2024302', 'Soon Due', '2024302@kampus.example', id \
         FROM study_programs LIMIT 1 RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO billings (student_id, semester, total_amount, paid_amount, \
         remaining_amount, status, due_date) VALUES ($1, $2, $3, 0, $3, 'unpaid', $4)",
    )
    .bind(student_id)
    .bind("2026/2027-Genap")
    .bind(4_000_000_i64)
    .bind(Utc::now() + Duration::days(3))
    .execute(&pool)
    .await
    .unwrap();

    let count = scheduler::reminder_tick(&pool, Utc::now()).await.unwrap();
    assert_eq!(count, 2);
}
