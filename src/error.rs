// src/error.rs

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// Global Application Error Enum.
/// Centralizes error handling and mapping to HTTP responses.
///
/// Eligibility failures and token failures are separate variants so the
/// presentation layer can tell "locked, wait" apart from "expired, regenerate".
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    // 403 Forbidden: attempts exhausted or lockout in force
    NotEligible(String),

    // 410 Gone: attempt token past its expiry
    TokenExpired,

    // 409 Conflict: attempt token already consumed
    TokenAlreadyUsed,

    // 409 Conflict: access record changed underneath the caller
    RecordVersionMismatch,

    // 404 Not Found
    EvaluationNotFound(String),

    // 400 Bad Request: answer references an unknown question
    InvalidAnswerSubmission(String),

    // 500 Internal Server Error
    InternalServerError(String),

    // 400 Bad Request
    BadRequest(String),

    // 401 Unauthorized
    AuthError(String),

    // 404 Not Found
    NotFound(String),

    // 409 Conflict (e.g., completing a superseded attempt)
    Conflict(String),
}

impl AppError {
    /// Stable machine-readable code included in every error body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotEligible(_) => "not_eligible",
            AppError::TokenExpired => "token_expired",
            AppError::TokenAlreadyUsed => "token_already_used",
            AppError::RecordVersionMismatch => "record_version_mismatch",
            AppError::EvaluationNotFound(_) => "evaluation_not_found",
            AppError::InvalidAnswerSubmission(_) => "invalid_answer_submission",
            AppError::InternalServerError(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::AuthError(_) => "unauthorized",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::NotEligible(msg) => write!(f, "not eligible: {}", msg),
            AppError::TokenExpired => write!(f, "attempt token expired, request a new one"),
            AppError::TokenAlreadyUsed => write!(f, "attempt token has already been used"),
            AppError::RecordVersionMismatch => {
                write!(f, "access record was modified concurrently")
            }
            AppError::EvaluationNotFound(id) => write!(f, "evaluation '{}' not found", id),
            AppError::InvalidAnswerSubmission(msg) => write!(f, "invalid answer: {}", msg),
            other => write!(f, "{:?}", other),
        }
    }
}

impl std::error::Error for AppError {}

/// Implements `IntoResponse` for `AppError`.
/// Converts the error into a JSON response with appropriate HTTP status code.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, error_message) = match self {
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::NotEligible(_) => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::TokenExpired => (StatusCode::GONE, self.to_string()),
            AppError::TokenAlreadyUsed | AppError::RecordVersionMismatch => {
                (StatusCode::CONFLICT, self.to_string())
            }
            AppError::EvaluationNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::InvalidAnswerSubmission(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::AuthError(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
        };
        let body = Json(json!({
            "error": error_message,
            "code": code,
        }));

        (status, body).into_response()
    }
}

/// Converts `sqlx::Error` into `AppError::InternalServerError`.
/// Allows using `?` operator on database queries.
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::InternalServerError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_and_eligibility_errors_have_distinct_statuses() {
        let locked = AppError::NotEligible("locked".to_string()).into_response();
        let expired = AppError::TokenExpired.into_response();
        let used = AppError::TokenAlreadyUsed.into_response();

        assert_eq!(locked.status(), StatusCode::FORBIDDEN);
        assert_eq!(expired.status(), StatusCode::GONE);
        assert_eq!(used.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_internal_error_is_masked() {
        let err = AppError::InternalServerError("pool exhausted".to_string());
        assert_eq!(err.code(), "internal_error");
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
