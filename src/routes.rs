use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::{billing::api, students, webhooks};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/payments", post(api::process_payment))
        .route("/api/payments/statistics", get(api::payment_statistics))
        .route("/api/payments/history/:student_id", get(api::payment_history))
        .route("/api/payments/:id", get(api::payment_detail))
        .route(
            "/api/billings/generate/:semester_id",
            post(api::generate_billing),
        )
        .route("/api/billings/student/:student_id", get(api::billing_summary))
        .route("/api/billings/outstanding", get(api::list_outstanding))
        .route(
            "/api/billings/can-register/:student_id",
            get(api::can_register),
        )
        .route(
            "/api/billings/eligibility-report",
            get(api::eligibility_report),
        )
        .route("/api/billings/:id/penalty", post(api::update_penalty))
        .route("/api/billings/:id", delete(api::delete_billing))
        .route(
            "/api/semesters",
            get(api::list_semesters).post(api::create_semester),
        )
        .route(
            "/api/students",
            get(students::list_students).post(students::create_student),
        )
        .route("/api/students/:id", get(students::get_student))
        .route("/api/programs", get(students::list_programs))
        .route("/api/webhooks/payment", post(webhooks::payment_webhook))
        .route("/api/webhooks/health", get(webhooks::health))
        .route(
            "/api/webhooks/simulate-payment",
            post(webhooks::simulate_payment),
        )
        .route(
            "/api/webhooks/test-all-students",
            post(webhooks::test_all_students),
        )
}
