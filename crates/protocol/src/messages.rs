//! Protocol message definitions for Agent Worker.
//!
//! Two families of messages live here:
//!
//! - Terminal control messages exchanged over the `/ws/terminal` duplex
//!   channel ([`ServerMessage`] and [`ClientMessage`]), one JSON object per
//!   websocket frame.
//! - Streamed invocation events ([`StreamEvent`]) written as NDJSON lines by
//!   `/api/run/stream`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Placeholder rendered for an exit code the OS did not report, such as a
/// process killed by a signal.
pub const UNKNOWN_EXIT_CODE: &str = "null";

// ============================================================================
// Terminal Messages
// ============================================================================

/// Server to client control message on the terminal channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Always the first message after an attach. Carries the resolved id the
    /// client should use to reattach.
    Session {
        /// Session identifier.
        id: String,
    },
    /// Terminal output, either live or replayed from the session buffer.
    Output {
        /// Raw terminal bytes decoded as UTF-8.
        data: String,
    },
    /// The shell process exited. The connection is closed right after.
    Exit {
        /// Process exit code.
        code: i32,
    },
}

impl ServerMessage {
    /// Serialize to the JSON text sent in a websocket frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a server message (used by clients and tests).
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Client to server control message on the terminal channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Keystrokes to forward to the shell.
    Input {
        /// Input text.
        data: String,
    },
    /// New terminal geometry. Missing dimensions keep the last known value.
    Resize {
        /// Columns.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        /// Rows.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    /// Kill the shell and end the session.
    Terminate,
}

impl ClientMessage {
    /// Leniently parse an inbound frame.
    ///
    /// Returns `None` for anything that is not a JSON object with a known
    /// `type`. Field values are coerced rather than rejected: a non-string
    /// `data` becomes its textual form (or empty when null/false), and
    /// dimensions may be numbers or numeric strings. A zero or unparseable
    /// dimension counts as missing.
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let object = value.as_object()?;

        match object.get("type")?.as_str()? {
            "input" => Some(ClientMessage::Input {
                data: coerce_text(object.get("data")),
            }),
            "resize" => Some(ClientMessage::Resize {
                cols: coerce_dimension(object.get("cols")),
                rows: coerce_dimension(object.get("rows")),
            }),
            "terminate" => Some(ClientMessage::Terminate),
            _ => None,
        }
    }

    /// Serialize to the JSON text sent in a websocket frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn coerce_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(true)) => "true".to_string(),
        _ => String::new(),
    }
}

fn coerce_dimension(value: Option<&Value>) -> Option<u16> {
    let parsed = match value? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }?;

    u16::try_from(parsed).ok().filter(|d| *d > 0)
}

// ============================================================================
// Invocation Events
// ============================================================================

/// One event of a streamed tool invocation.
///
/// Encoded as `{"type": "...", "data": "..."}`. A stream carries any number
/// of `stdout`/`stderr` events followed by exactly one terminal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum StreamEvent {
    /// A chunk of the tool's standard output.
    Stdout(String),
    /// A chunk of the tool's standard error.
    Stderr(String),
    /// Terminal: the process exited with this code.
    Exit(String),
    /// Terminal: the invocation failed (timeout, spawn failure).
    Error(String),
}

impl StreamEvent {
    /// Build the terminal exit event for an optional exit code.
    pub fn exit(code: Option<i32>) -> Self {
        StreamEvent::Exit(
            code.map(|c| c.to_string())
                .unwrap_or_else(|| UNKNOWN_EXIT_CODE.to_string()),
        )
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Exit(_) | StreamEvent::Error(_))
    }

    /// Name of the event as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Stdout(_) => "stdout",
            StreamEvent::Stderr(_) => "stderr",
            StreamEvent::Exit(_) => "exit",
            StreamEvent::Error(_) => "error",
        }
    }

    /// The event payload.
    pub fn data(&self) -> &str {
        match self {
            StreamEvent::Stdout(d)
            | StreamEvent::Stderr(d)
            | StreamEvent::Exit(d)
            | StreamEvent::Error(d) => d,
        }
    }
}
