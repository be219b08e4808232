//! HTTP surface of the daemon.
//!
//! | Route               | Handler                                   |
//! |---------------------|-------------------------------------------|
//! | `GET /healthz`      | liveness probe                            |
//! | `POST /api/run`     | run a tool, JSON result                   |
//! | `POST /api/run/stream` | run a tool, NDJSON event stream        |
//! | `GET /ws/terminal`  | persistent PTY session over a websocket   |
//! | anything else       | the static web UI                         |

pub mod error;
pub mod run;
pub mod terminal;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::response::Html;
use axum::routing::{any, get, post};
use axum::Router;

pub use error::{ApiError, ErrorBody};

use crate::invoke::StreamingInvoker;
use crate::session::SessionMultiplexer;

/// Shared state of all handlers.
pub struct AppState {
    /// One-shot tool runner.
    pub invoker: StreamingInvoker,
    /// Terminal session multiplexer.
    pub multiplexer: SessionMultiplexer,
    /// Static UI document.
    pub ui_path: PathBuf,
}

/// Build the application router.
pub fn router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    let api = Router::new()
        .route("/api/run", post(run::run))
        .route("/api/run/stream", post(run::run_stream))
        .layer(DefaultBodyLimit::max(max_body_bytes));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws/terminal", any(terminal::terminal_ws))
        .merge(api)
        .fallback(serve_ui)
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serve the UI document, re-read on every request.
async fn serve_ui(State(state): State<Arc<AppState>>) -> Result<Html<String>, ApiError> {
    tokio::fs::read_to_string(&state.ui_path)
        .await
        .map(Html)
        .map_err(|e| {
            tracing::warn!(path = %state.ui_path.display(), error = %e, "Failed to read UI");
            ApiError::UiUnavailable
        })
}
