pub mod api;
pub mod eligibility;
pub mod generator;
pub mod ledger;
pub mod models;
pub mod payments;
pub mod penalty;
pub mod reconciliation;
pub mod scheduler;

pub use eligibility::{Eligibility, EligibilityGate};
pub use generator::{BillingGenerator, GenerationReport};
pub use ledger::BillingLedger;
pub use models::{
    Billing, BillingStatus, Payment, PaymentReconciliation, PaymentStatus, ReconciliationStatus,
    Semester,
};
pub use payments::{PaymentProcessor, ProcessedPayment};
pub use reconciliation::{WebhookDisposition, WebhookOutcome, WebhookReconciler};
