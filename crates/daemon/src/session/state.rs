//! Session actor.
//!
//! Each session is owned by a single tokio task that holds the PTY process,
//! the replay buffer, the bound connection and the idle deadline. Everything
//! that mutates a session arrives either as a [`SessionCommand`] through its
//! mailbox or as a [`PtyEvent`] from the process, and is handled one at a
//! time in a `select!` loop.
//!
//! ```text
//!              attach                      attach (supersede)
//!   DETACHED ─────────► ATTACHED ◄─────────────────┐
//!      ▲  │               │  │                     │
//!      │  │    detach     │  └─────────────────────┘
//!      │  │ ◄─────────────┘
//!      │  │ idle deadline
//!      │  ▼
//!   TERMINATED ◄── process exit / terminate (any state)
//! ```

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use std::time::Duration;

use protocol::ServerMessage;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::buffer::OutputBuffer;
use super::manager::SessionRegistry;
use super::pty::{PtyEvent, PtyProcess, SessionError, SessionId};

/// Identifier of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// Allocate a process-unique connection id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value, for logging.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Instruction for a connection's transport task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send this message to the client.
    Frame(ServerMessage),
    /// Close the connection.
    Close,
}

/// The session's view of a bound transport connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// Wrap the sending half of a connection's outbound queue.
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: ConnectionId::next(),
            outbound,
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message. Returns false if the transport has gone away.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.outbound.send(Outbound::Frame(message)).is_ok()
    }

    /// Ask the transport to close.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session id.
    pub id: SessionId,
    /// Whether a connection is bound.
    pub attached: bool,
    /// Bytes held for replay.
    pub buffered_bytes: usize,
    /// Current columns.
    pub cols: u16,
    /// Current rows.
    pub rows: u16,
    /// Shell process id.
    pub pid: Option<u32>,
}

/// Messages accepted by a session actor.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Attach {
        connection: ConnectionHandle,
        replay: bool,
        resize: Option<(u16, u16)>,
        ack: oneshot::Sender<()>,
    },
    Detach {
        connection_id: ConnectionId,
    },
    Input {
        connection_id: ConnectionId,
        data: String,
    },
    Resize {
        connection_id: ConnectionId,
        cols: u16,
        rows: u16,
    },
    /// `connection_id` is `None` for server-initiated termination.
    Terminate {
        connection_id: Option<ConnectionId>,
        ack: Option<oneshot::Sender<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Cloneable address of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    instance: u64,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// Session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registry-assigned instance number, distinct for every spawned session.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Whether the session task is still running.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Bind `connection`, superseding any previous one.
    ///
    /// Resolves once the `session` message (and replay, if requested) has
    /// been queued on the connection. Fails if the session ended first.
    pub async fn attach(
        &self,
        connection: ConnectionHandle,
        replay: bool,
        resize: Option<(u16, u16)>,
    ) -> Result<(), SessionError> {
        let (ack, done) = oneshot::channel();
        self.send(SessionCommand::Attach {
            connection,
            replay,
            resize,
            ack,
        })?;
        done.await
            .map_err(|_| SessionError::AlreadyTerminated(self.id.clone()))
    }

    /// Unbind `connection_id` if it is still the bound connection.
    pub fn detach(&self, connection_id: ConnectionId) {
        let _ = self.send(SessionCommand::Detach { connection_id });
    }

    /// Forward keystrokes from `connection_id`.
    pub fn input(&self, connection_id: ConnectionId, data: String) {
        let _ = self.send(SessionCommand::Input {
            connection_id,
            data,
        });
    }

    /// Resize on behalf of `connection_id`.
    pub fn resize(&self, connection_id: ConnectionId, cols: u16, rows: u16) {
        let _ = self.send(SessionCommand::Resize {
            connection_id,
            cols,
            rows,
        });
    }

    /// Terminate on behalf of `connection_id`. Ignored unless it is bound.
    pub fn terminate_from(&self, connection_id: ConnectionId) {
        let _ = self.send(SessionCommand::Terminate {
            connection_id: Some(connection_id),
            ack: None,
        });
    }

    /// Terminate the session and wait for it to finish.
    ///
    /// Returns immediately if the session has already ended.
    pub async fn terminate(&self) {
        let (ack, done) = oneshot::channel();
        if self
            .send(SessionCommand::Terminate {
                connection_id: None,
                ack: Some(ack),
            })
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Current state, or `None` if the session has ended.
    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot { reply }).ok()?;
        rx.await.ok()
    }

    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.tx
            .send(command)
            .map_err(|_| SessionError::AlreadyTerminated(self.id.clone()))
    }
}

enum SessionState {
    Detached { idle_deadline: Instant },
    Attached { connection: ConnectionHandle },
}

/// Fixed per-session parameters.
#[derive(Debug, Clone)]
pub(crate) struct ActorSettings {
    pub ttl: Duration,
    pub max_buffer_bytes: usize,
    pub cols: u16,
    pub rows: u16,
}

struct SessionActor {
    id: SessionId,
    instance: u64,
    process: Box<dyn PtyProcess>,
    buffer: OutputBuffer,
    state: SessionState,
    ttl: Duration,
    cols: u16,
    rows: u16,
    registry: Weak<SessionRegistry>,
}

/// Start the actor for a freshly spawned process and return its handle.
///
/// The session starts detached with its idle deadline armed.
pub(crate) fn start_session(
    id: SessionId,
    instance: u64,
    process: Box<dyn PtyProcess>,
    events: mpsc::UnboundedReceiver<PtyEvent>,
    settings: ActorSettings,
    registry: Weak<SessionRegistry>,
) -> SessionHandle {
    let (tx, commands) = mpsc::unbounded_channel();

    let actor = SessionActor {
        id: id.clone(),
        instance,
        process,
        buffer: OutputBuffer::new(settings.max_buffer_bytes),
        state: SessionState::Detached {
            idle_deadline: Instant::now() + settings.ttl,
        },
        ttl: settings.ttl,
        cols: settings.cols,
        rows: settings.rows,
        registry,
    };

    tokio::spawn(actor.run(commands, events));

    SessionHandle { id, instance, tx }
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut events: mpsc::UnboundedReceiver<PtyEvent>,
    ) {
        tracing::info!(session_id = %self.id, pid = ?self.process.pid(), "Session started");

        loop {
            let deadline = match &self.state {
                SessionState::Detached { idle_deadline } => Some(*idle_deadline),
                SessionState::Attached { .. } => None,
            };

            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        self.kill_process();
                        ControlFlow::Break(())
                    }
                },
                event = events.recv() => match event {
                    Some(PtyEvent::Data(data)) => {
                        self.on_output(data);
                        ControlFlow::Continue(())
                    }
                    Some(PtyEvent::Exit(code)) => {
                        self.on_exit(code);
                        ControlFlow::Break(())
                    }
                    None => {
                        self.on_exit(-1);
                        ControlFlow::Break(())
                    }
                },
                _ = idle(deadline) => {
                    self.on_idle_expired();
                    ControlFlow::Break(())
                }
            };

            if flow.is_break() {
                break;
            }
        }
    }

    fn handle_command(&mut self, command: SessionCommand) -> ControlFlow<()> {
        match command {
            SessionCommand::Attach {
                connection,
                replay,
                resize,
                ack,
            } => {
                self.attach(connection, replay, resize);
                let _ = ack.send(());
            }
            SessionCommand::Detach { connection_id } => {
                if self.is_bound(connection_id) {
                    self.state = SessionState::Detached {
                        idle_deadline: Instant::now() + self.ttl,
                    };
                    tracing::info!(
                        session_id = %self.id,
                        connection_id = %connection_id,
                        ttl_ms = self.ttl.as_millis() as u64,
                        "Session detached"
                    );
                } else {
                    tracing::debug!(
                        session_id = %self.id,
                        connection_id = %connection_id,
                        "Ignoring detach from stale connection"
                    );
                }
            }
            SessionCommand::Input {
                connection_id,
                data,
            } => {
                if self.is_bound(connection_id) {
                    if let Err(e) = self.process.write(data.as_bytes()) {
                        tracing::warn!(session_id = %self.id, error = %e, "Failed to write input");
                    }
                } else {
                    tracing::trace!(session_id = %self.id, connection_id = %connection_id, "Dropping stale input");
                }
            }
            SessionCommand::Resize {
                connection_id,
                cols,
                rows,
            } => {
                if self.is_bound(connection_id) {
                    self.apply_resize(cols, rows);
                }
            }
            SessionCommand::Terminate { connection_id, ack } => {
                if let Some(connection_id) = connection_id {
                    if !self.is_bound(connection_id) {
                        tracing::debug!(
                            session_id = %self.id,
                            connection_id = %connection_id,
                            "Ignoring terminate from stale connection"
                        );
                        return ControlFlow::Continue(());
                    }
                }
                self.on_terminate();
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                return ControlFlow::Break(());
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
        ControlFlow::Continue(())
    }

    fn attach(&mut self, connection: ConnectionHandle, replay: bool, resize: Option<(u16, u16)>) {
        if let SessionState::Attached { connection: previous } = &self.state {
            tracing::info!(
                session_id = %self.id,
                previous = %previous.id(),
                connection_id = %connection.id(),
                "Superseding bound connection"
            );
            previous.close();
        }

        if let Some((cols, rows)) = resize {
            self.apply_resize(cols, rows);
        }

        connection.send(ServerMessage::Session {
            id: self.id.clone(),
        });
        if replay && !self.buffer.is_empty() {
            connection.send(ServerMessage::Output {
                data: self.buffer.to_text(),
            });
        }

        tracing::info!(
            session_id = %self.id,
            connection_id = %connection.id(),
            replay,
            replayed_bytes = if replay { self.buffer.len() } else { 0 },
            "Session attached"
        );

        self.state = SessionState::Attached { connection };
    }

    fn on_output(&mut self, data: Vec<u8>) {
        self.buffer.push(&data);
        if let SessionState::Attached { connection } = &self.state {
            let data = String::from_utf8_lossy(&data).into_owned();
            if !connection.send(ServerMessage::Output { data }) {
                tracing::trace!(session_id = %self.id, "Bound connection gone, output buffered only");
            }
        }
    }

    fn on_exit(&mut self, code: i32) {
        tracing::info!(session_id = %self.id, code, "Session process exited");
        if let SessionState::Attached { connection } = &self.state {
            connection.send(ServerMessage::Exit { code });
            connection.close();
        }
        self.unregister();
    }

    fn on_terminate(&mut self) {
        tracing::info!(session_id = %self.id, "Session terminated");
        self.kill_process();
        self.unregister();
        if let SessionState::Attached { connection } = &self.state {
            connection.close();
        }
    }

    fn on_idle_expired(&mut self) {
        tracing::info!(
            session_id = %self.id,
            ttl_ms = self.ttl.as_millis() as u64,
            "Idle session expired"
        );
        self.kill_process();
        self.unregister();
    }

    fn apply_resize(&mut self, cols: u16, rows: u16) {
        match self.process.resize(cols, rows) {
            Ok(()) => {
                self.cols = cols;
                self.rows = rows;
                tracing::debug!(session_id = %self.id, cols, rows, "Resized session");
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Failed to resize session");
            }
        }
    }

    fn kill_process(&mut self) {
        if let Err(e) = self.process.kill() {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to kill session process");
        }
    }

    fn unregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_instance(&self.id, self.instance);
        }
    }

    fn is_bound(&self, connection_id: ConnectionId) -> bool {
        matches!(&self.state, SessionState::Attached { connection } if connection.id() == connection_id)
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            attached: matches!(self.state, SessionState::Attached { .. }),
            buffered_bytes: self.buffer.len(),
            cols: self.cols,
            rows: self.rows,
            pid: self.process.pid(),
        }
    }
}
