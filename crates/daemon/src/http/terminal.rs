//! `/ws/terminal` websocket handler.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::AppState;
use crate::session::{AttachParams, Outbound, SessionMultiplexer};

/// Query string of a terminal connection. Values are parsed leniently.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalQuery {
    pub session_id: Option<String>,
    pub cols: Option<String>,
    pub rows: Option<String>,
    pub replay: Option<String>,
}

impl TerminalQuery {
    /// Attach parameters, substituting defaults for missing or bad values.
    pub fn into_params(self) -> AttachParams {
        let defaults = AttachParams::default();
        AttachParams {
            session_id: self.session_id.filter(|id| !id.is_empty()),
            cols: parse_dimension(self.cols.as_deref()).unwrap_or(defaults.cols),
            rows: parse_dimension(self.rows.as_deref()).unwrap_or(defaults.rows),
            replay: matches!(self.replay.as_deref(), Some("1") | Some("true")),
        }
    }
}

fn parse_dimension(value: Option<&str>) -> Option<u16> {
    value?.trim().parse::<u16>().ok().filter(|v| *v > 0)
}

/// `GET /ws/terminal`: upgrade and bind the socket to a session.
pub async fn terminal_ws(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let params = query.into_params();
    let multiplexer = state.multiplexer.clone();
    ws.on_upgrade(move |socket| handle_terminal_socket(socket, multiplexer, params))
}

async fn handle_terminal_socket(
    socket: WebSocket,
    multiplexer: SessionMultiplexer,
    params: AttachParams,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

    let mut attached = match multiplexer.attach(&params, outbound_tx).await {
        Ok(attached) => attached,
        Err(e) => {
            tracing::error!(
                requested = ?params.session_id,
                error = %e,
                "Failed to attach terminal"
            );
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    let session_id = attached.session_id().to_string();
    let connection_id = attached.connection_id();
    tracing::info!(session_id = %session_id, connection_id = %connection_id, "Terminal connected");

    // Forward session output to the socket
    let mut output_task = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Frame(message) => {
                    let text = match message.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to encode terminal message");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            message = ws_receiver.next() => match message {
                Some(Ok(Message::Text(text))) => attached.handle_frame(text.as_str()),
                Some(Ok(Message::Binary(data))) => {
                    attached.handle_frame(&String::from_utf8_lossy(&data));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(session_id = %session_id, error = %e, "WebSocket error");
                    break;
                }
            },
            _ = &mut output_task => break,
        }
    }

    output_task.abort();
    attached.detach();
    tracing::info!(session_id = %session_id, connection_id = %connection_id, "Terminal disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(session_id: Option<&str>, cols: Option<&str>, rows: Option<&str>, replay: Option<&str>) -> TerminalQuery {
        TerminalQuery {
            session_id: session_id.map(str::to_string),
            cols: cols.map(str::to_string),
            rows: rows.map(str::to_string),
            replay: replay.map(str::to_string),
        }
    }

    #[test]
    fn test_defaults() {
        let params = TerminalQuery::default().into_params();
        assert_eq!(params, AttachParams::default());
        assert_eq!((params.cols, params.rows), (80, 24));
        assert!(!params.replay);
    }

    #[test]
    fn test_explicit_values() {
        let params = query(Some("abc"), Some("120"), Some("40"), Some("1")).into_params();
        assert_eq!(params.session_id.as_deref(), Some("abc"));
        assert_eq!((params.cols, params.rows), (120, 40));
        assert!(params.replay);

        assert!(query(None, None, None, Some("true")).into_params().replay);
        assert!(!query(None, None, None, Some("yes")).into_params().replay);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let params = query(Some(""), Some("wide"), Some("0"), None).into_params();
        assert_eq!(params.session_id, None);
        assert_eq!((params.cols, params.rows), (80, 24));
    }
}
