use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("validation failed")]
    Validation(Vec<String>),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Db(_) | AppError::Internal(_) => "internal",
            AppError::NotFound(_) => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::Validation(_) => "validation_failed",
            AppError::Conflict(_) => "conflict",
        }
    }

    /// Collapses a unique-constraint violation into a Conflict, leaving every
    /// other database error untouched.
    pub fn conflict_on_unique(err: sqlx::Error, message: &str) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some("23505") {
                return AppError::Conflict(message.to_string());
            }
        }
        AppError::Db(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Db(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(?self);

        // Internal causes are logged above but never echoed to callers.
        let message = match &self {
            AppError::Db(_) | AppError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        let mut body = json!({
            "error": {
                "kind": self.kind(),
                "message": message,
            }
        });
        if let AppError::Validation(details) = &self {
            body["error"]["details"] = json!(details);
        }
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_kind_and_details() {
        let err = AppError::Validation(vec![
            "amount must be greater than 0".to_string(),
            "status must be one of: success, pending, failed".to_string(),
        ]);
        assert_eq!(err.kind(), "validation_failed");
        match err {
            AppError::Validation(details) => assert_eq!(details.len(), 2),
            _ => unreachable!(),
        }
    }

    #[test]
    fn internal_errors_do_not_leak_cause() {
        let err = AppError::Internal("connection refused to 10.0.0.3".to_string());
        assert_eq!(err.kind(), "internal");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
