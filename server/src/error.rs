//! HTTP error surface.
//!
//! Store errors are a closed set; this module is the single place where they
//! become status codes. Every error body has the shape
//! `{"error":{"code":"...","message":"..."}}`.

use axum::{http::StatusCode, response::IntoResponse, Json};
use minitower_core::wire::{ErrorBody, ErrorDetail};
use minitower_store::StoreError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_input", message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", message)
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        tracing::error!(error = %err, "internal error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "internal error",
        )
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            // Lease handlers turn NoWork into a bare 204 before conversion.
            StoreError::NoWork => Self::new(StatusCode::NO_CONTENT, "no_work", ""),
            StoreError::InvalidLease => {
                Self::new(StatusCode::GONE, "invalid_lease", err.to_string())
            }
            StoreError::LeaseConflict => {
                Self::new(StatusCode::CONFLICT, "lease_conflict", err.to_string())
            }
            StoreError::AttemptNotActive => {
                Self::new(StatusCode::GONE, "attempt_not_active", err.to_string())
            }
            StoreError::RunnerBusy => {
                Self::new(StatusCode::CONFLICT, "runner_busy", err.to_string())
            }
            StoreError::NotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "not_found", err.to_string())
            }
            StoreError::InvalidInput(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_input", err.to_string())
            }
            StoreError::Conflict(_) => Self::new(StatusCode::CONFLICT, "conflict", err.to_string()),
            StoreError::Db(_) | StoreError::Migrate(_) => Self::internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        if self.status == StatusCode::NO_CONTENT {
            return self.status.into_response();
        }
        let body = Json(ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        });
        (self.status, body).into_response()
    }
}
