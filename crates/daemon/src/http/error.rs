//! HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::invoke::InvokeError;

/// Errors returned by the HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request body exceeded the configured limit.
    #[error("payload too large")]
    PayloadTooLarge,

    /// Request body could not be read.
    #[error("{0}")]
    BadBody(String),

    /// Request body was not a valid run request.
    #[error("{0}")]
    InvalidJson(String),

    /// Streaming run for a tool that is not configured.
    #[error("unknown tool")]
    UnknownTool,

    /// Non-streaming run failed.
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    /// The static UI document could not be read.
    #[error("failed to load ui")]
    UiUnavailable,
}

/// JSON error body: `{"ok": false, "error": "..."}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: String,
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnknownTool => StatusCode::BAD_REQUEST,
            ApiError::BadBody(_)
            | ApiError::InvalidJson(_)
            | ApiError::Invoke(_)
            | ApiError::UiUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let ApiError::UiUnavailable = self {
            return (status, self.to_string()).into_response();
        }

        let body = ErrorBody {
            ok: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
