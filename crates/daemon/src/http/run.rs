//! `/api/run` and `/api/run/stream` handlers.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream;
use protocol::{encode_line, NDJSON_CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ApiError;
use super::AppState;
use crate::invoke::{InvokeError, DEFAULT_TOOL};

/// Body of a run request. Every field is optional and loosely typed.
#[derive(Debug, Default, Deserialize)]
pub struct RunRequest {
    pub tool: Option<Value>,
    pub prompt: Option<Value>,
}

impl RunRequest {
    /// Tool and prompt. Empty, `null`, `false` and `0` count as missing;
    /// other scalars are stringified.
    fn into_parts(self) -> (String, String) {
        (
            self.tool
                .and_then(coerce)
                .unwrap_or_else(|| DEFAULT_TOOL.to_string()),
            self.prompt.and_then(coerce).unwrap_or_default(),
        )
    }
}

fn coerce(value: Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s),
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(true) => Some("true".to_string()),
        other => Some(other.to_string()),
    }
}

/// Successful non-streaming run.
#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub ok: bool,
    pub tool: String,
    pub stdout: String,
    pub stderr: String,
}

/// Parse a run request body. An empty body counts as `{}`.
fn parse_request(body: Result<Bytes, BytesRejection>) -> Result<RunRequest, ApiError> {
    let bytes = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge
        } else {
            ApiError::BadBody(rejection.body_text())
        }
    })?;

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(RunRequest::default());
    }

    serde_json::from_slice(&bytes).map_err(|e| ApiError::InvalidJson(e.to_string()))
}

/// `POST /api/run`: run a tool to completion.
pub async fn run(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<RunResponse>, ApiError> {
    let (tool, prompt) = parse_request(body)?.into_parts();

    let output = state
        .invoker
        .run(&tool, prompt)
        .await
        .inspect_err(|e| tracing::debug!(tool = %tool, error = %e, "Run failed"))?;

    Ok(Json(RunResponse {
        ok: true,
        tool,
        stdout: output.stdout,
        stderr: output.stderr,
    }))
}

/// `POST /api/run/stream`: run a tool, streaming NDJSON events.
pub async fn run_stream(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    let (tool, prompt) = parse_request(body)?.into_parts();

    let events = state.invoker.invoke(&tool, prompt).map_err(|e| match e {
        InvokeError::UnknownTool(_) => ApiError::UnknownTool,
        other => ApiError::Invoke(other),
    })?;

    // The receiver lives in the body; a client disconnect drops it, which
    // stops the tool.
    let lines = stream::unfold(events, |mut events| async move {
        let event = events.recv().await?;
        Some((encode_line(&event), events))
    });

    Ok((
        [
            (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(lines),
    )
        .into_response())
}
