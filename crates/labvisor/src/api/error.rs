//! API error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::LabError;

pub type ApiResult<T> = Result<T, ApiError>;

/// An error rendered as `{"error": ..., "code": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<LabError> for ApiError {
    fn from(err: LabError) -> Self {
        let (status, code) = match &err {
            LabError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            LabError::AllocationExhausted { .. } | LabError::LimitReached(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "RESOURCES_EXHAUSTED")
            }
            LabError::ProvisionTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "PROVISION_TIMEOUT"),
            LabError::BackendUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "BACKEND_UNAVAILABLE")
            }
            LabError::AlreadyActive(_) => (StatusCode::CONFLICT, "ALREADY_RUNNING"),
            LabError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            LabError::AttachFailed(_) => (StatusCode::BAD_GATEWAY, "ATTACH_FAILED"),
            LabError::InvalidTransition { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
            LabError::Backend(_) => (StatusCode::BAD_GATEWAY, "BACKEND_ERROR"),
        };
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(code = self.code, "{}", self.message);
        } else {
            tracing::debug!(code = self.code, "{}", self.message);
        }
        let body = ErrorResponse {
            error: self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}
