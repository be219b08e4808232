//! Connection to session multiplexing.
//!
//! The multiplexer is transport-agnostic: a transport hands it the attach
//! parameters and the sending half of its outbound queue, gets back an
//! [`AttachedConnection`], feeds it every inbound text frame, and drops it
//! when the transport closes. Dropping detaches the connection; the session
//! itself keeps running until its idle deadline.

use std::sync::Arc;

use protocol::ClientMessage;
use tokio::sync::mpsc;

use super::manager::SessionRegistry;
use super::pty::SessionError;
use super::state::{ConnectionHandle, ConnectionId, Outbound, SessionHandle};

/// Resolution attempts before giving up on a session that keeps dying
/// between lookup and attach.
const MAX_ATTACH_ATTEMPTS: usize = 3;

/// Longest client-supplied id that will be adopted.
const MAX_SESSION_ID_LEN: usize = 128;

/// Parameters of an incoming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachParams {
    /// Session the client wants to reattach to.
    pub session_id: Option<String>,
    /// Terminal columns.
    pub cols: u16,
    /// Terminal rows.
    pub rows: u16,
    /// Replay buffered output after attaching.
    pub replay: bool,
}

impl Default for AttachParams {
    fn default() -> Self {
        Self {
            session_id: None,
            cols: 80,
            rows: 24,
            replay: false,
        }
    }
}

/// Whether `id` may be used verbatim as a session id.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Binds transport connections to sessions.
#[derive(Clone)]
pub struct SessionMultiplexer {
    registry: Arc<SessionRegistry>,
    adopt_client_ids: bool,
}

impl SessionMultiplexer {
    /// Create a multiplexer over `registry`.
    pub fn new(registry: Arc<SessionRegistry>, adopt_client_ids: bool) -> Self {
        Self {
            registry,
            adopt_client_ids,
        }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Resolve or create a session and bind a new connection to it.
    ///
    /// On success the `session` message has already been queued on
    /// `outbound`, followed by the replay frame when requested.
    pub async fn attach(
        &self,
        params: &AttachParams,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Result<AttachedConnection, SessionError> {
        let connection = ConnectionHandle::new(outbound);
        let connection_id = connection.id();
        let mut last_id = String::new();

        for attempt in 1..=MAX_ATTACH_ATTEMPTS {
            let (session, resize) = self.resolve(params).await?;
            last_id = session.id().to_string();

            match session
                .attach(connection.clone(), params.replay, resize)
                .await
            {
                Ok(()) => {
                    return Ok(AttachedConnection {
                        session,
                        connection_id,
                        cols: params.cols,
                        rows: params.rows,
                    });
                }
                Err(_) => {
                    tracing::debug!(
                        session_id = %last_id,
                        attempt,
                        "Session ended before attach, resolving again"
                    );
                }
            }
        }

        Err(SessionError::AlreadyTerminated(last_id))
    }

    /// Pick the session for `params`, plus the resize to apply on attach.
    async fn resolve(
        &self,
        params: &AttachParams,
    ) -> Result<(SessionHandle, Option<(u16, u16)>), SessionError> {
        let geometry = (params.cols, params.rows);

        if let Some(id) = params.session_id.as_deref().filter(|id| !id.is_empty()) {
            if let Some(session) = self.registry.get(id) {
                return Ok((session, Some(geometry)));
            }

            if self.adopt_client_ids && is_valid_session_id(id) {
                let (session, created) =
                    self.registry.get_or_create(id, params.cols, params.rows).await?;
                return Ok((session, (!created).then_some(geometry)));
            }

            tracing::debug!(requested = %id, "Unknown session id, issuing a fresh one");
        }

        let session = self.registry.create(params.cols, params.rows).await?;
        Ok((session, None))
    }
}

/// A connection bound to a session.
///
/// Routes inbound frames to the session. Dropping it detaches.
pub struct AttachedConnection {
    session: SessionHandle,
    connection_id: ConnectionId,
    cols: u16,
    rows: u16,
}

impl AttachedConnection {
    /// Resolved session id.
    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// This connection's id.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Geometry last requested by this connection.
    pub fn geometry(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    /// Handle one inbound text frame. Unrecognized frames are ignored.
    pub fn handle_frame(&mut self, text: &str) {
        match ClientMessage::parse(text) {
            Some(message) => self.handle_message(message),
            None => tracing::trace!(
                session_id = %self.session.id(),
                connection_id = %self.connection_id,
                "Ignoring unrecognized frame"
            ),
        }
    }

    /// Handle one parsed control message.
    pub fn handle_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Input { data } => self.session.input(self.connection_id, data),
            ClientMessage::Resize { cols, rows } => {
                self.cols = cols.unwrap_or(self.cols);
                self.rows = rows.unwrap_or(self.rows);
                self.session
                    .resize(self.connection_id, self.cols, self.rows);
            }
            ClientMessage::Terminate => self.session.terminate_from(self.connection_id),
        }
    }

    /// Detach from the session. Equivalent to dropping.
    pub fn detach(self) {}
}

impl Drop for AttachedConnection {
    fn drop(&mut self) {
        self.session.detach(self.connection_id);
    }
}
