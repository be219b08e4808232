//! PTY process spawning and I/O.
//!
//! The session layer talks to its shell through the [`PtyProcess`] and
//! [`PtySpawner`] traits so the lifecycle logic can be driven by a scripted
//! process in tests. [`NativePtySpawner`] is the production implementation on
//! top of `portable-pty`.
//!
//! Blocking PTY reads and writes each run on a dedicated OS thread. Output
//! and the final exit status are delivered to the owner as [`PtyEvent`]s.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;

use super::buffer::incomplete_utf8_tail;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session has already been terminated.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the session.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output from a running PTY process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Bytes written by the process. Never ends inside a UTF-8 sequence
    /// unless the process itself wrote invalid UTF-8.
    Data(Vec<u8>),
    /// The process exited. Always the last event.
    Exit(i32),
}

/// Parameters for spawning a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Shell executable.
    pub shell: String,
    /// Initial columns.
    pub cols: u16,
    /// Initial rows.
    pub rows: u16,
    /// Working directory.
    pub cwd: PathBuf,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

/// A running process attached to a pseudo-terminal.
pub trait PtyProcess: Send {
    /// Queue bytes for the process's terminal input.
    fn write(&mut self, data: &[u8]) -> Result<(), SessionError>;

    /// Change the terminal geometry.
    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError>;

    /// Forcefully terminate the process. Safe to call more than once.
    fn kill(&mut self) -> Result<(), SessionError>;

    /// OS process id, when known.
    fn pid(&self) -> Option<u32>;
}

/// Factory for [`PtyProcess`]es.
pub trait PtySpawner: Send + Sync {
    /// Start a process. Its output and exit arrive on the returned receiver.
    fn spawn(
        &self,
        request: &SpawnRequest,
    ) -> Result<(Box<dyn PtyProcess>, mpsc::UnboundedReceiver<PtyEvent>), SessionError>;
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Largest single write handed to the PTY.
const WRITE_CHUNK_SIZE: usize = 1024;

/// How long the exit event waits for in-flight output when something other
/// than the shell (a background job) still holds the terminal open.
const EXIT_DRAIN: Duration = Duration::from_millis(200);

/// Event channel shared by the reader and the waiter. The waiter takes the
/// sender when it reports exit, so nothing can follow the exit event.
type EventSink = Arc<Mutex<Option<mpsc::UnboundedSender<PtyEvent>>>>;

fn emit(sink: &EventSink, event: PtyEvent) {
    if let Some(tx) = sink.lock().as_ref() {
        let _ = tx.send(event);
    }
}

/// Spawns shells on real pseudo-terminals.
#[derive(Debug, Clone)]
pub struct NativePtySpawner {
    term: String,
}

impl NativePtySpawner {
    /// Create a spawner that sets `TERM` to `term` in every child.
    pub fn new(term: impl Into<String>) -> Self {
        Self { term: term.into() }
    }
}

impl Default for NativePtySpawner {
    fn default() -> Self {
        Self::new("xterm-256color")
    }
}

impl PtySpawner for NativePtySpawner {
    fn spawn(
        &self,
        request: &SpawnRequest,
    ) -> Result<(Box<dyn PtyProcess>, mpsc::UnboundedReceiver<PtyEvent>), SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&request.shell);
        cmd.cwd(&request.cwd);
        cmd.env("TERM", &self.term);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        // The child holds its own copy; keeping ours would delay EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let sink: EventSink = Arc::new(Mutex::new(Some(event_tx)));
        let (input_tx, input_rx) = std::sync::mpsc::channel::<Vec<u8>>();
        let (reader_done_tx, reader_done_rx) = std::sync::mpsc::channel::<()>();
        let exited = Arc::new(AtomicBool::new(false));

        spawn_writer_thread(pid, writer, input_rx);

        let reader_sink = Arc::clone(&sink);
        std::thread::spawn(move || {
            read_until_eof(pid, reader, &reader_sink);
            let _ = reader_done_tx.send(());
        });

        // Exit is reported from waitpid, not from EOF on the master: a
        // background job can keep the slave open long after the shell is gone.
        let exited_flag = Arc::clone(&exited);
        std::thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(e) => {
                    tracing::warn!(pid = ?pid, error = %e, "Failed to reap PTY child");
                    -1
                }
            };
            exited_flag.store(true, Ordering::SeqCst);

            if reader_done_rx.recv_timeout(EXIT_DRAIN).is_err() {
                tracing::debug!(pid = ?pid, "PTY still held open after exit");
            }
            tracing::debug!(pid = ?pid, code, "PTY process exited");
            if let Some(tx) = sink.lock().take() {
                let _ = tx.send(PtyEvent::Exit(code));
            }
        });

        tracing::debug!(
            pid = ?pid,
            shell = %request.shell,
            cols = request.cols,
            rows = request.rows,
            "Spawned PTY process"
        );

        let process = NativePtyProcess {
            master: Mutex::new(pair.master),
            input_tx,
            killer,
            exited,
            pid,
        };

        Ok((Box::new(process), event_rx))
    }
}

/// Pump PTY output to the event channel, holding back split UTF-8 sequences.
fn read_until_eof(
    pid: Option<u32>,
    mut reader: Box<dyn Read + Send>,
    sink: &EventSink,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut carry: Vec<u8> = Vec::new();

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                carry.extend_from_slice(&buf[..n]);
                let keep = incomplete_utf8_tail(&carry);
                let tail = carry.split_off(carry.len() - keep);
                let chunk = std::mem::replace(&mut carry, tail);
                if !chunk.is_empty() {
                    emit(sink, PtyEvent::Data(chunk));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO on the master once the slave side closes.
                tracing::trace!(pid = ?pid, error = %e, "PTY read ended");
                break;
            }
        }
    }

    if !carry.is_empty() {
        emit(sink, PtyEvent::Data(carry));
    }
}

fn spawn_writer_thread(
    pid: Option<u32>,
    mut writer: Box<dyn Write + Send>,
    input_rx: std::sync::mpsc::Receiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        while let Ok(data) = input_rx.recv() {
            for chunk in data.chunks(WRITE_CHUNK_SIZE) {
                if let Err(e) = writer.write_all(chunk).and_then(|_| writer.flush()) {
                    tracing::debug!(pid = ?pid, error = %e, "PTY write failed");
                    return;
                }
            }
        }
    });
}

/// A shell running on a native pseudo-terminal.
struct NativePtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    input_tx: std::sync::mpsc::Sender<Vec<u8>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl PtyProcess for NativePtyProcess {
    fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.input_tx
            .send(data.to_vec())
            .map_err(|_| SessionError::WriteFailed("writer closed".to_string()))
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    fn kill(&mut self) -> Result<(), SessionError> {
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.killer.kill() {
            Ok(()) => Ok(()),
            // Raced with a natural exit.
            Err(_) if self.exited.load(Ordering::SeqCst) => Ok(()),
            Err(e) => Err(SessionError::KillFailed(e.to_string())),
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for NativePtyProcess {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            tracing::debug!(pid = ?self.pid, error = %e, "Kill on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh_request() -> SpawnRequest {
        SpawnRequest {
            shell: "/bin/sh".to_string(),
            cols: 80,
            rows: 24,
            cwd: std::env::temp_dir(),
            env: vec![],
        }
    }

    /// Collect output until `marker` shows up or the exit event arrives.
    async fn read_until(
        rx: &mut mpsc::UnboundedReceiver<PtyEvent>,
        marker: &str,
    ) -> (String, Option<i32>) {
        let mut output = String::new();
        loop {
            match timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(PtyEvent::Data(data))) => {
                    output.push_str(&String::from_utf8_lossy(&data));
                    if output.contains(marker) {
                        return (output, None);
                    }
                }
                Ok(Some(PtyEvent::Exit(code))) => return (output, Some(code)),
                Ok(None) | Err(_) => return (output, None),
            }
        }
    }

    #[tokio::test]
    async fn test_spawn_and_echo() {
        let spawner = NativePtySpawner::default();
        let (mut process, mut rx) = spawner.spawn(&sh_request()).unwrap();
        assert!(process.pid().is_some());

        process.write(b"echo pty_output_marker\n").unwrap();
        let (output, _) = read_until(&mut rx, "pty_output_marker\r\n").await;
        assert!(output.contains("pty_output_marker"), "got {:?}", output);

        process.kill().unwrap();
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let spawner = NativePtySpawner::default();
        let (mut process, mut rx) = spawner.spawn(&sh_request()).unwrap();

        process.write(b"exit 7\n").unwrap();
        let (_, code) = read_until(&mut rx, "\u{0}never\u{0}").await;
        assert_eq!(code, Some(7));

        // Killing after exit is a no-op.
        assert!(process.kill().is_ok());
    }

    #[tokio::test]
    async fn test_exit_reported_while_background_job_holds_terminal() {
        let spawner = NativePtySpawner::default();
        let (mut process, mut rx) = spawner.spawn(&sh_request()).unwrap();

        let started = std::time::Instant::now();
        process
            .write(b"sleep 20 &\necho bg_pid=$!\nexit 3\n")
            .unwrap();
        let (output, code) = read_until(&mut rx, "\u{0}never\u{0}").await;

        assert_eq!(code, Some(3), "output: {:?}", output);
        assert!(started.elapsed() < Duration::from_secs(3));
        // Nothing follows the exit event.
        assert!(matches!(
            timeout(Duration::from_millis(300), rx.recv()).await,
            Ok(None) | Err(_)
        ));

        // The echoed command line reads `bg_pid=$!`; only the output parses.
        let bg_pid = output
            .split("bg_pid=")
            .skip(1)
            .find_map(|rest| rest.split_whitespace().next()?.parse::<i32>().ok());
        if let Some(pid) = bg_pid {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
    }

    #[tokio::test]
    async fn test_env_and_term() {
        let spawner = NativePtySpawner::new("xterm-test");
        let mut request = sh_request();
        request.env.push(("AW_TEST_VAR".to_string(), "test_value".to_string()));
        let (mut process, mut rx) = spawner.spawn(&request).unwrap();

        process.write(b"echo \"$AW_TEST_VAR:$TERM\"\n").unwrap();
        let (output, _) = read_until(&mut rx, "test_value:xterm-test").await;
        assert!(output.contains("test_value:xterm-test"), "got {:?}", output);

        process.kill().unwrap();
    }

    #[tokio::test]
    async fn test_resize() {
        let spawner = NativePtySpawner::default();
        let (mut process, mut rx) = spawner.spawn(&sh_request()).unwrap();

        process.resize(120, 40).unwrap();
        process.write(b"stty size\n").unwrap();
        let (output, _) = read_until(&mut rx, "40 120").await;
        assert!(output.contains("40 120"), "got {:?}", output);

        process.kill().unwrap();
    }

    #[tokio::test]
    async fn test_kill_ends_stream() {
        let spawner = NativePtySpawner::default();
        let (mut process, mut rx) = spawner.spawn(&sh_request()).unwrap();

        process.kill().unwrap();
        process.kill().unwrap();

        let mut saw_exit = false;
        while let Ok(Some(event)) = timeout(Duration::from_secs(5), rx.recv()).await {
            if matches!(event, PtyEvent::Exit(_)) {
                saw_exit = true;
            }
        }
        assert!(saw_exit);
    }

    #[test]
    fn test_spawn_missing_shell_fails() {
        let spawner = NativePtySpawner::default();
        let mut request = sh_request();
        request.shell = "/nonexistent/shell".to_string();
        assert!(matches!(
            spawner.spawn(&request),
            Err(SessionError::SpawnFailed(_))
        ));
    }
}
