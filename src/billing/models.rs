use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// key: billing-status -> pure derivation from totals and time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingStatus {
    Unpaid,
    Partial,
    Paid,
    Overdue,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Unpaid => "unpaid",
            BillingStatus::Partial => "partial",
            BillingStatus::Paid => "paid",
            BillingStatus::Overdue => "overdue",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unpaid" => Some(BillingStatus::Unpaid),
            "partial" => Some(BillingStatus::Partial),
            "paid" => Some(BillingStatus::Paid),
            "overdue" => Some(BillingStatus::Overdue),
            _ => None,
        }
    }

    /// Status is a function of the current totals and the clock, never an
    /// incremental transition. Paid wins over Overdue; a partial payment on
    /// an overdue billing leaves it Overdue.
    pub fn derive(
        paid_amount: i64,
        total_amount: i64,
        now: DateTime<Utc>,
        due_date: DateTime<Utc>,
    ) -> Self {
        if paid_amount >= total_amount {
            BillingStatus::Paid
        } else if now > due_date {
            BillingStatus::Overdue
        } else if paid_amount > 0 {
            BillingStatus::Partial
        } else {
            BillingStatus::Unpaid
        }
    }
}

/// key: payment-status -> gateway lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Failed => "failed",
        }
    }
}

/// key: reconciliation-status -> audit row outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconciliationStatus {
    Synced,
    Failed,
    Pending,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStatus::Synced => "synced",
            ReconciliationStatus::Failed => "failed",
            ReconciliationStatus::Pending => "pending",
        }
    }
}

/// key: billing-model -> one semester's tuition obligation for one student
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Billing {
    pub id: i64,
    pub student_id: i32,
    pub semester: String,
    pub total_amount: i64,
    pub paid_amount: i64,
    pub remaining_amount: i64,
    pub penalty: i64,
    pub status: String,
    pub due_date: DateTime<Utc>,
    pub last_payment_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Billing {
    pub fn is_paid(&self) -> bool {
        self.status == BillingStatus::Paid.as_str()
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now > self.due_date && !self.is_paid()
    }

    pub fn days_overdue(&self, now: DateTime<Utc>) -> i64 {
        if !self.is_overdue(now) {
            return 0;
        }
        (now - self.due_date).num_days()
    }
}

/// key: payment-model -> one settlement attempt against a billing
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub student_id: i32,
    pub billing_id: i64,
    pub payment_method_id: Option<i32>,
    pub transaction_id: String,
    pub reference_code: String,
    pub amount: i64,
    pub status: String,
    pub gateway_name: Option<String>,
    pub gateway_response: Option<serde_json::Value>,
    pub payment_date: Option<DateTime<Utc>>,
    pub confirmation_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn is_confirmed(&self) -> bool {
        self.status == PaymentStatus::Confirmed.as_str()
    }
}

/// key: reconciliation-model -> append-only audit of webhook outcomes
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PaymentReconciliation {
    pub id: i64,
    pub payment_id: i64,
    pub gateway_name: String,
    pub status: String,
    pub gateway_response: Option<serde_json::Value>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Semester {
    pub id: i32,
    pub name: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub billing_generation_date: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Internal reference for a manual/gateway payment: `PAY<UTC ts><6 hex>`.
pub fn generate_reference_code(now: DateTime<Utc>) -> String {
    reference_code_with_prefix("PAY", now)
}

/// Simulation flows stamp their own prefix (`SIM-`, `TEST-`).
pub fn reference_code_with_prefix(prefix: &str, now: DateTime<Utc>) -> String {
    let timestamp = now.format("%Y%m%d%H%M%S");
    let suffix: String = Uuid::new_v4().simple().to_string()[..6].to_uppercase();
    format!("{prefix}{timestamp}{suffix}")
}
