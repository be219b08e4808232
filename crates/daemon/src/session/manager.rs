//! Session registry.
//!
//! Maps session ids to running session actors. Shells are spawned off the
//! async workers and registered through the `DashMap` entry API, so at most
//! one live session is ever stored per id; a session
//! removes itself when it ends, checking its instance number so it never
//! evicts a newer session stored under the same id.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::pty::{PtyEvent, PtyProcess, PtySpawner, SessionError, SessionId, SpawnRequest};
use super::state::{start_session, ActorSettings, SessionHandle};
use crate::config::SessionConfig;

/// How long [`SessionRegistry::shutdown`] waits for each session.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters shared by every session the registry spawns.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Shell executable.
    pub shell: String,
    /// Working directory.
    pub cwd: PathBuf,
    /// Idle TTL for detached sessions.
    pub ttl: Duration,
    /// Replay buffer limit in bytes.
    pub max_buffer_bytes: usize,
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            cwd: config.cwd.clone(),
            ttl: config.ttl(),
            max_buffer_bytes: config.max_buffer_bytes,
        }
    }
}

/// Thread-safe registry of live sessions.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
    spawner: Arc<dyn PtySpawner>,
    settings: SessionSettings,
    next_instance: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new(spawner: Arc<dyn PtySpawner>, settings: SessionSettings) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            spawner,
            settings,
            next_instance: AtomicU64::new(1),
        })
    }

    /// Registry settings.
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Look up a live session.
    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .filter(SessionHandle::is_alive)
    }

    /// Return the live session for `id`, spawning one if there is none.
    ///
    /// The boolean is true when a new session was created. The process is
    /// spawned on the blocking pool outside any map lock; if another caller
    /// registered a live session for `id` in the meantime, that session wins
    /// and the extra process is killed.
    pub async fn get_or_create(
        self: &Arc<Self>,
        id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(SessionHandle, bool), SessionError> {
        if let Some(handle) = self.get(id) {
            return Ok((handle, false));
        }

        let (mut process, events) = self.spawn_process(id, cols, rows).await?;

        let handle = match self.sessions.entry(id.to_string()) {
            Entry::Occupied(entry) if entry.get().is_alive() => {
                tracing::debug!(session_id = %id, "Lost spawn race, discarding process");
                if let Err(e) = process.kill() {
                    tracing::warn!(session_id = %id, error = %e, "Failed to kill discarded process");
                }
                return Ok((entry.get().clone(), false));
            }
            Entry::Occupied(mut entry) => {
                let handle = self.start(id, process, events, cols, rows);
                entry.insert(handle.clone());
                handle
            }
            Entry::Vacant(entry) => {
                let handle = self.start(id, process, events, cols, rows);
                entry.insert(handle.clone());
                handle
            }
        };

        Ok((handle, true))
    }

    /// Spawn a session under a freshly generated id.
    pub async fn create(self: &Arc<Self>, cols: u16, rows: u16) -> Result<SessionHandle, SessionError> {
        loop {
            let id = Uuid::new_v4().to_string();
            let (handle, created) = self.get_or_create(&id, cols, rows).await?;
            if created {
                return Ok(handle);
            }
        }
    }

    /// Start the shell process. Opening the PTY and forking block, so this
    /// runs on the blocking pool.
    async fn spawn_process(
        &self,
        id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(Box<dyn PtyProcess>, mpsc::UnboundedReceiver<PtyEvent>), SessionError> {
        let request = SpawnRequest {
            shell: self.settings.shell.clone(),
            cols,
            rows,
            cwd: self.settings.cwd.clone(),
            env: Vec::new(),
        };
        let shell = request.shell.clone();
        let spawner = Arc::clone(&self.spawner);

        tokio::task::spawn_blocking(move || spawner.spawn(&request))
            .await
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?
            .map_err(|e| {
                tracing::error!(session_id = %id, shell = %shell, error = %e, "Failed to spawn session");
                e
            })
    }

    fn start(
        self: &Arc<Self>,
        id: &str,
        process: Box<dyn PtyProcess>,
        events: mpsc::UnboundedReceiver<PtyEvent>,
        cols: u16,
        rows: u16,
    ) -> SessionHandle {
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let settings = ActorSettings {
            ttl: self.settings.ttl,
            max_buffer_bytes: self.settings.max_buffer_bytes,
            cols,
            rows,
        };

        start_session(
            id.to_string(),
            instance,
            process,
            events,
            settings,
            Arc::downgrade(self),
        )
    }

    /// Remove the mapping for `id`. Idempotent.
    pub fn remove(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.remove(id).map(|(_, handle)| handle)
    }

    /// Remove `id` only if it still maps to `instance`.
    pub(crate) fn remove_instance(&self, id: &str, instance: u64) -> bool {
        let removed = self
            .sessions
            .remove_if(id, |_, handle| handle.instance() == instance)
            .is_some();
        if removed {
            tracing::debug!(session_id = %id, instance, "Session unregistered");
        }
        removed
    }

    /// Terminate a session by id and wait for it to finish.
    pub async fn terminate(&self, id: &str) -> Result<(), SessionError> {
        let handle = self
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        handle.terminate().await;
        Ok(())
    }

    /// Terminate every session, waiting up to `timeout` for each.
    pub async fn shutdown(&self, timeout: Duration) {
        let handles: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        if handles.is_empty() {
            return;
        }

        tracing::info!(count = handles.len(), "Terminating sessions");

        join_all(handles.iter().map(|handle| async move {
            if tokio::time::timeout(timeout, handle.terminate()).await.is_err() {
                tracing::warn!(session_id = %handle.id(), "Session did not stop in time");
            }
        }))
        .await;

        self.sessions.clear();
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Ids of registered sessions.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::MockSpawner;
    use crate::session::state::{ConnectionHandle, Outbound};
    use protocol::ServerMessage;
    use tokio::sync::mpsc;

    const TTL: Duration = Duration::from_secs(60);

    fn settings(max_buffer_bytes: usize) -> SessionSettings {
        SessionSettings {
            shell: "/bin/sh".to_string(),
            cwd: std::env::temp_dir(),
            ttl: TTL,
            max_buffer_bytes,
        }
    }

    fn registry(spawner: &Arc<MockSpawner>) -> Arc<SessionRegistry> {
        SessionRegistry::new(spawner.clone(), settings(1024))
    }

    fn connection() -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(tx), rx)
    }

    /// Let spawned actor tasks run.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn frame(message: ServerMessage) -> Outbound {
        Outbound::Frame(message)
    }

    fn output(data: &str) -> Outbound {
        frame(ServerMessage::Output {
            data: data.to_string(),
        })
    }

    fn session_msg(id: &str) -> Outbound {
        frame(ServerMessage::Session { id: id.to_string() })
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_live_session() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);

        let (first, created) = registry.get_or_create("abc", 80, 24).await.unwrap();
        assert!(created);
        let (second, created) = registry.get_or_create("abc", 100, 30).await.unwrap();
        assert!(!created);

        assert_eq!(first.instance(), second.instance());
        assert_eq!(spawner.count(), 1);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.ids(), vec!["abc".to_string()]);

        let request = &spawner.process(0).request;
        assert_eq!((request.cols, request.rows), (80, 24));
        assert_eq!(request.shell, "/bin/sh");
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_registers_one_session() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);

        let (first, second) = tokio::join!(
            registry.get_or_create("abc", 80, 24),
            registry.get_or_create("abc", 80, 24)
        );
        let (first, first_created) = first.unwrap();
        let (second, second_created) = second.unwrap();

        assert!(first_created ^ second_created);
        assert_eq!(first.instance(), second.instance());
        assert_eq!(registry.count(), 1);

        // Any process spawned by the losing caller is killed, the winner's is not.
        let kills: usize = (0..spawner.count())
            .map(|i| spawner.process(i).kills())
            .sum();
        assert_eq!(kills, spawner.count() - 1);
    }

    #[tokio::test]
    async fn test_create_generates_uuid() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);

        let handle = registry.create(80, 24).await.unwrap();
        assert_eq!(handle.id().len(), 36);
        assert!(registry.get(handle.id()).is_some());
    }

    #[tokio::test]
    async fn test_spawn_failure_registers_nothing() {
        let spawner = MockSpawner::failing();
        let registry = registry(&spawner);

        let result = registry.get_or_create("abc", 80, 24).await;
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_get_unknown_session() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);
        assert!(registry.get("missing").is_none());
        assert!(matches!(
            registry.terminate("missing").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_attach_sends_session_first() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);
        let (handle, _) = registry.get_or_create("abc", 80, 24).await.unwrap();

        let (conn, mut rx) = connection();
        handle.attach(conn, true, None).await.unwrap();

        // Nothing buffered yet, so no replay frame.
        assert_eq!(drain(&mut rx), vec![session_msg("abc")]);
    }

    #[tokio::test]
    async fn test_live_output_and_input() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);
        let (handle, _) = registry.get_or_create("abc", 80, 24).await.unwrap();
        let process = spawner.process(0);

        let (conn, mut rx) = connection();
        let conn_id = conn.id();
        handle.attach(conn, false, None).await.unwrap();

        process.emit("hello");
        handle.input(conn_id, "ls\r".to_string());
        settle().await;

        assert_eq!(drain(&mut rx), vec![session_msg("abc"), output("hello")]);
        assert_eq!(process.log.lock().written(), "ls\r");
    }

    #[tokio::test]
    async fn test_replay_after_reattach() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);
        let (handle, _) = registry.get_or_create("abc", 80, 24).await.unwrap();
        let process = spawner.process(0);

        // Output produced before anyone attached is buffered.
        process.emit("one ");
        settle().await;

        let (conn, mut rx) = connection();
        let first_id = conn.id();
        handle.attach(conn, false, None).await.unwrap();
        process.emit("two ");
        settle().await;
        handle.detach(first_id);
        process.emit("three");
        settle().await;
        drain(&mut rx);

        let (conn, mut rx) = connection();
        handle.attach(conn, true, None).await.unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![session_msg("abc"), output("one two three")]
        );
    }

    #[tokio::test]
    async fn test_replay_is_truncated_to_newest_bytes() {
        let spawner = MockSpawner::new();
        let registry = SessionRegistry::new(spawner.clone(), settings(6));
        let (handle, _) = registry.get_or_create("abc", 80, 24).await.unwrap();
        let process = spawner.process(0);

        process.emit("0123");
        process.emit("456789");
        settle().await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.buffered_bytes, 6);

        let (conn, mut rx) = connection();
        handle.attach(conn, true, None).await.unwrap();
        assert_eq!(drain(&mut rx), vec![session_msg("abc"), output("456789")]);
    }

    #[tokio::test]
    async fn test_supersession_closes_previous_connection() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);
        let (handle, _) = registry.get_or_create("abc", 80, 24).await.unwrap();
        let process = spawner.process(0);

        let (first, mut first_rx) = connection();
        let first_id = first.id();
        handle.attach(first, false, None).await.unwrap();

        let (second, mut second_rx) = connection();
        handle.attach(second, false, None).await.unwrap();

        process.emit("live");
        // Stale messages from the superseded connection are ignored.
        handle.input(first_id, "stale".to_string());
        handle.detach(first_id);
        settle().await;

        assert_eq!(
            drain(&mut first_rx),
            vec![session_msg("abc"), Outbound::Close]
        );
        assert_eq!(
            drain(&mut second_rx),
            vec![session_msg("abc"), output("live")]
        );
        assert!(process.log.lock().writes.is_empty());
        assert!(handle.snapshot().await.unwrap().attached);
    }

    #[tokio::test]
    async fn test_resize_on_attach_and_message() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);
        let (handle, _) = registry.get_or_create("abc", 80, 24).await.unwrap();
        let process = spawner.process(0);

        let (conn, _rx) = connection();
        let conn_id = conn.id();
        handle.attach(conn, false, Some((120, 40))).await.unwrap();
        handle.resize(conn_id, 100, 30);
        settle().await;

        assert_eq!(process.log.lock().resizes, vec![(120, 40), (100, 30)]);
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!((snapshot.cols, snapshot.rows), (100, 30));
        assert_eq!(snapshot.pid, Some(4242));
    }

    #[tokio::test]
    async fn test_process_exit_notifies_and_unregisters() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);
        let (handle, _) = registry.get_or_create("abc", 80, 24).await.unwrap();
        let process = spawner.process(0);

        let (conn, mut rx) = connection();
        handle.attach(conn, false, None).await.unwrap();

        process.emit("bye");
        process.exit(3);
        settle().await;

        assert_eq!(
            drain(&mut rx),
            vec![
                session_msg("abc"),
                output("bye"),
                frame(ServerMessage::Exit { code: 3 }),
                Outbound::Close,
            ]
        );
        assert!(!handle.is_alive());
        assert!(registry.get("abc").is_none());
        assert_eq!(registry.count(), 0);

        // Reattaching under the same id spawns a brand-new session.
        let (fresh, created) = registry.get_or_create("abc", 80, 24).await.unwrap();
        assert!(created);
        assert_ne!(fresh.instance(), handle.instance());
        assert_eq!(fresh.snapshot().await.unwrap().buffered_bytes, 0);
    }

    #[tokio::test]
    async fn test_terminate_from_bound_connection() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);
        let (handle, _) = registry.get_or_create("abc", 80, 24).await.unwrap();
        let process = spawner.process(0);

        let (conn, mut rx) = connection();
        let conn_id = conn.id();
        handle.attach(conn, false, None).await.unwrap();
        handle.terminate_from(conn_id);
        settle().await;

        assert_eq!(drain(&mut rx), vec![session_msg("abc"), Outbound::Close]);
        assert_eq!(process.kills(), 1);
        assert_eq!(registry.count(), 0);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);
        let (handle, _) = registry.get_or_create("abc", 80, 24).await.unwrap();

        registry.terminate("abc").await.unwrap();
        assert_eq!(spawner.process(0).kills(), 1);

        handle.terminate().await;
        assert!(matches!(
            registry.terminate("abc").await,
            Err(SessionError::NotFound(_))
        ));
        assert_eq!(spawner.process(0).kills(), 1);
        assert!(handle.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn test_stale_remove_does_not_evict_new_instance() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);
        let (old, _) = registry.get_or_create("abc", 80, 24).await.unwrap();
        old.terminate().await;

        let (new, _) = registry.get_or_create("abc", 80, 24).await.unwrap();
        assert!(!registry.remove_instance("abc", old.instance()));
        assert!(registry.get("abc").is_some());
        assert!(registry.remove_instance("abc", new.instance()));
        assert!(registry.remove("abc").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_terminates_everything() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);
        let (a, _) = registry.get_or_create("a", 80, 24).await.unwrap();
        let (b, _) = registry.get_or_create("b", 80, 24).await.unwrap();

        registry.shutdown(SHUTDOWN_TIMEOUT).await;

        assert_eq!(registry.count(), 0);
        assert!(!a.is_alive());
        assert!(!b.is_alive());
        assert_eq!(spawner.process(0).kills(), 1);
        assert_eq!(spawner.process(1).kills(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_expires_after_ttl() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);
        let (handle, _) = registry.get_or_create("abc", 80, 24).await.unwrap();

        let (conn, _rx) = connection();
        let conn_id = conn.id();
        handle.attach(conn, false, None).await.unwrap();
        handle.detach(conn_id);
        settle().await;

        tokio::time::sleep(TTL - Duration::from_secs(1)).await;
        settle().await;
        assert!(registry.get("abc").is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert!(registry.get("abc").is_none());
        assert_eq!(spawner.process(0).kills(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unattached_session_expires() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);
        registry.get_or_create("abc", 80, 24).await.unwrap();

        tokio::time::sleep(TTL + Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_cancels_idle_expiry() {
        let spawner = MockSpawner::new();
        let registry = registry(&spawner);
        let (handle, _) = registry.get_or_create("abc", 80, 24).await.unwrap();

        let (conn, _rx) = connection();
        let conn_id = conn.id();
        handle.attach(conn, false, None).await.unwrap();
        handle.detach(conn_id);
        settle().await;

        tokio::time::sleep(TTL / 2).await;
        let (conn, _rx2) = connection();
        handle.attach(conn, false, None).await.unwrap();

        tokio::time::sleep(TTL * 2).await;
        settle().await;
        assert!(registry.get("abc").is_some());
        assert_eq!(spawner.process(0).kills(), 0);
    }
}
