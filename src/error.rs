// src/error.rs
use axum::{response::{IntoResponse, Response}, Json};
use http::StatusCode;
use serde_json::json;

use crate::services::duplicate_guard::CheckoutConflict;
use crate::services::ledger::LedgerError;

#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    ValidationError(String),
    Conflict {
        message: String,
        conflicts: Vec<CheckoutConflict>,
    },
    InvalidState(String),
    Internal(String),
}

impl AppError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        AppError::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        AppError::Forbidden(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::ValidationError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AppError::Internal(msg.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, conflicts) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg, None),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg, None),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg, None),
            AppError::Conflict { message, conflicts } => {
                (StatusCode::CONFLICT, "conflict", message, Some(conflicts))
            }
            AppError::InvalidState(msg) => (StatusCode::CONFLICT, "invalid_state", msg, None),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                    None,
                )
            }
        };

        let body = match conflicts {
            Some(conflicts) => json!({ "error": code, "message": message, "conflicts": conflicts }),
            None => json!({ "error": code, "message": message }),
        };

        (status, Json(body)).into_response()
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Validation(msg) => AppError::ValidationError(msg),
            LedgerError::Conflict(conflicts) => {
                let owners = conflicts
                    .iter()
                    .map(|c| format!("checkout {} ({})", c.checkout_id, c.employee_name))
                    .collect::<Vec<_>>()
                    .join(", ");
                AppError::Conflict {
                    message: format!("Invoice numbers already attached to {owners}"),
                    conflicts,
                }
            }
            e @ LedgerError::InvalidState { .. } => AppError::InvalidState(e.to_string()),
            e @ LedgerError::Concurrency(_) => AppError::Conflict {
                message: e.to_string(),
                conflicts: Vec::new(),
            },
            e @ LedgerError::NotFound(_) => AppError::NotFound(e.to_string()),
            LedgerError::Store(e) => AppError::Internal(e.to_string()),
        }
    }
}
