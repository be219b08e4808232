//! Session management module.
//!
//! This module provides PTY spawning and persistent session lifecycle
//! management. Sessions outlive the connections attached to them, keep a
//! bounded replay buffer, and are reclaimed once left detached for the
//! configured TTL.

pub mod buffer;
pub mod manager;
pub mod multiplexer;
pub mod pty;
pub mod state;

#[cfg(test)]
pub(crate) mod mock;

pub use buffer::OutputBuffer;
pub use manager::{SessionRegistry, SessionSettings, SHUTDOWN_TIMEOUT};
pub use multiplexer::{is_valid_session_id, AttachParams, AttachedConnection, SessionMultiplexer};
pub use pty::{
    NativePtySpawner, PtyEvent, PtyProcess, PtySpawner, SessionError, SessionId, SpawnRequest,
};
pub use state::{ConnectionHandle, ConnectionId, Outbound, SessionHandle, SessionSnapshot};
