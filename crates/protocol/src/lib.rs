//! # Agent Worker Protocol Library
//!
//! Wire types shared by the Agent Worker daemon and its clients.
//!
//! ## Overview
//!
//! - **Terminal Messages**: JSON control messages exchanged over the
//!   `/ws/terminal` websocket, one message per frame
//! - **Invocation Events**: `stdout`/`stderr`/`exit`/`error` events of a
//!   streamed one-shot tool run
//! - **NDJSON Framing**: line encoding and an incremental decoder for the
//!   streamed event body
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │   Terminal Messages      │   │   Invocation Events      │
//! │ session/output/exit  ◄── │   │ stdout/stderr/exit/error │
//! │ input/resize/terminate ──►   ├──────────────────────────┤
//! ├──────────────────────────┤   │   NDJSON line framing    │
//! │   WebSocket text frames  │   │   HTTP chunked body      │
//! └──────────────────────────┘   └──────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{encode_line, ClientMessage, NdjsonDecoder, StreamEvent};
//!
//! // Inbound frames are parsed leniently; garbage is simply ignored.
//! assert_eq!(ClientMessage::parse("{\"type\":\"terminate\"}"), Some(ClientMessage::Terminate));
//! assert_eq!(ClientMessage::parse("garbage"), None);
//!
//! // Streamed events round-trip through the line codec.
//! let line = encode_line(&StreamEvent::Stdout("hello".to_string())).unwrap();
//! let mut decoder = NdjsonDecoder::new();
//! let events: Vec<StreamEvent> = decoder.decode(&line).unwrap();
//! assert_eq!(events, vec![StreamEvent::Stdout("hello".to_string())]);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Terminal messages and invocation events
//! - [`framing`]: NDJSON codec
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{encode_line, NdjsonDecoder, MAX_LINE_SIZE, NDJSON_CONTENT_TYPE};
pub use messages::{ClientMessage, ServerMessage, StreamEvent, UNKNOWN_EXIT_CODE};
