//! Scripted PTY processes for session tests.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::pty::{PtyEvent, PtyProcess, PtySpawner, SessionError, SpawnRequest};

/// Everything a session did to its mock process.
#[derive(Debug, Default)]
pub(crate) struct MockLog {
    pub writes: Vec<Vec<u8>>,
    pub resizes: Vec<(u16, u16)>,
    pub kills: usize,
}

impl MockLog {
    pub fn written(&self) -> String {
        self.writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }
}

/// Test-side control of one spawned mock process.
#[derive(Clone)]
pub(crate) struct MockControl {
    pub request: SpawnRequest,
    pub log: Arc<Mutex<MockLog>>,
    events: mpsc::UnboundedSender<PtyEvent>,
}

impl MockControl {
    /// Make the process print `text`.
    pub fn emit(&self, text: &str) {
        let _ = self.events.send(PtyEvent::Data(text.as_bytes().to_vec()));
    }

    /// Make the process exit.
    pub fn exit(&self, code: i32) {
        let _ = self.events.send(PtyEvent::Exit(code));
    }

    pub fn kills(&self) -> usize {
        self.log.lock().kills
    }
}

struct MockProcess {
    log: Arc<Mutex<MockLog>>,
}

impl PtyProcess for MockProcess {
    fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.log.lock().writes.push(data.to_vec());
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.log.lock().resizes.push((cols, rows));
        Ok(())
    }

    fn kill(&mut self) -> Result<(), SessionError> {
        self.log.lock().kills += 1;
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(4242)
    }
}

/// Spawner handing out [`MockProcess`]es.
#[derive(Default)]
pub(crate) struct MockSpawner {
    spawned: Mutex<Vec<MockControl>>,
    fail: bool,
}

impl MockSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A spawner whose every spawn fails.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            spawned: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    pub fn count(&self) -> usize {
        self.spawned.lock().len()
    }

    /// Control of the `index`th spawned process.
    pub fn process(&self, index: usize) -> MockControl {
        self.spawned.lock()[index].clone()
    }
}

impl PtySpawner for MockSpawner {
    fn spawn(
        &self,
        request: &SpawnRequest,
    ) -> Result<(Box<dyn PtyProcess>, mpsc::UnboundedReceiver<PtyEvent>), SessionError> {
        if self.fail {
            return Err(SessionError::SpawnFailed("mock spawn failure".to_string()));
        }

        let (events, rx) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(MockLog::default()));
        self.spawned.lock().push(MockControl {
            request: request.clone(),
            log: Arc::clone(&log),
            events,
        });

        Ok((Box::new(MockProcess { log }), rx))
    }
}
