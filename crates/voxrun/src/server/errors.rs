//! HTTP error mapping for the run service.

use crate::runner::{ErrorCode, ErrorInfo, RunnerError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug)]
pub struct ApiError(pub RunnerError);

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorInfo,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0.code {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            code if code.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RunnerError> for ApiError {
    fn from(err: RunnerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = %self.0.code, error = %self.0.message, "request failed");
        } else {
            tracing::debug!(code = %self.0.code, error = %self.0.message, "request rejected");
        }
        let body = ErrorEnvelope {
            error: self.0.to_error_info(),
        };
        (status, Json(body)).into_response()
    }
}
