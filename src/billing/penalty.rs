use chrono::{DateTime, Utc};

/// Late-payment penalty accrued on a billing: zero until the due date has
/// passed, then `per_day_rate` per whole elapsed day, capped at
/// `max_penalty`. Days are truncated, never rounded, so the first unit of
/// penalty lands 24h after the deadline.
pub fn calculate(
    due_date: DateTime<Utc>,
    now: DateTime<Utc>,
    per_day_rate: i64,
    max_penalty: i64,
) -> i64 {
    if now <= due_date {
        return 0;
    }
    let days_overdue = (now - due_date).num_days();
    (days_overdue * per_day_rate).min(max_penalty)
}
