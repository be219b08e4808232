//! One-shot tool invocation.
//!
//! A tool is a named executable from the configured tool table. Each
//! invocation spawns exactly one child process, writes the prompt to its
//! stdin, and streams its output back as [`StreamEvent`]s. The process,
//! its timeout and the event stream are owned by a single driver task, so
//! they live and die together: the process is signalled on timeout and
//! when the caller stops listening.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use protocol::StreamEvent;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::config::InvokeConfig;
use crate::session::buffer::incomplete_utf8_tail;

/// Message of the terminal `error` event emitted on timeout.
pub const TIMEOUT_MESSAGE: &str = "request timed out";

/// Default tool when a request names none.
pub const DEFAULT_TOOL: &str = "claude";

/// Capacity of the per-invocation event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Buffer size for reading child output.
const READ_BUFFER_SIZE: usize = 8192;

/// Time a signalled process gets to exit before it is killed outright.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Errors from tool invocation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// The tool name is not in the tool table.
    #[error("unknown tool")]
    UnknownTool(String),

    /// The process did not finish within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The process exited unsuccessfully. Carries its stderr, or a summary
    /// of the exit code when stderr was empty.
    #[error("{0}")]
    NonZeroExit(String),

    /// The process could not be started or awaited.
    #[error("{0}")]
    Spawn(String),
}

/// Output of a successful non-streaming invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvokeOutput {
    /// Accumulated standard output.
    pub stdout: String,
    /// Accumulated standard error.
    pub stderr: String,
}

/// Tool name to executable mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolRegistry {
    tools: BTreeMap<String, String>,
}

impl ToolRegistry {
    /// Build a registry from a name to command map.
    pub fn new(tools: BTreeMap<String, String>) -> Self {
        Self { tools }
    }

    /// Command for `tool`, if configured.
    pub fn resolve(&self, tool: &str) -> Option<&str> {
        self.tools.get(tool).map(String::as_str)
    }

    /// Configured tool names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }
}

/// Spawns tools and streams their output.
#[derive(Debug, Clone)]
pub struct StreamingInvoker {
    tools: Arc<ToolRegistry>,
    timeout: Duration,
}

impl StreamingInvoker {
    /// Create an invoker with the given tool table and per-request timeout.
    pub fn new(tools: ToolRegistry, timeout: Duration) -> Self {
        Self {
            tools: Arc::new(tools),
            timeout,
        }
    }

    /// Create an invoker from the `[invoke]` configuration section.
    pub fn from_config(config: &InvokeConfig) -> Self {
        Self::new(
            ToolRegistry::new(config.tools.clone()),
            config.request_timeout(),
        )
    }

    /// The tool table.
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Start `tool` with `prompt` on stdin.
    ///
    /// Fails before anything is spawned if the tool is unknown. Otherwise the
    /// receiver yields `stdout`/`stderr` chunks in arrival order followed by
    /// exactly one `exit` or `error` event. Dropping the receiver early
    /// terminates the process.
    pub fn invoke(
        &self,
        tool: &str,
        prompt: String,
    ) -> Result<mpsc::Receiver<StreamEvent>, InvokeError> {
        let command = self
            .tools
            .resolve(tool)
            .ok_or_else(|| InvokeError::UnknownTool(tool.to_string()))?
            .to_string();

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(drive(tool.to_string(), command, prompt, self.timeout, tx));
        Ok(rx)
    }

    /// Run `tool` to completion and collect its output.
    pub async fn run(&self, tool: &str, prompt: String) -> Result<InvokeOutput, InvokeError> {
        let mut events = self.invoke(tool, prompt)?;
        let mut output = InvokeOutput::default();

        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Stdout(data) => output.stdout.push_str(&data),
                StreamEvent::Stderr(data) => output.stderr.push_str(&data),
                StreamEvent::Exit(code) if code == "0" => return Ok(output),
                StreamEvent::Exit(code) => {
                    return Err(InvokeError::NonZeroExit(if output.stderr.is_empty() {
                        format!("process exited with {code}")
                    } else {
                        output.stderr
                    }));
                }
                StreamEvent::Error(message) if message == TIMEOUT_MESSAGE => {
                    return Err(InvokeError::Timeout)
                }
                StreamEvent::Error(message) => return Err(InvokeError::Spawn(message)),
            }
        }

        Err(InvokeError::Spawn("tool stream ended unexpectedly".to_string()))
    }
}

/// Own one tool process from spawn to its terminal event.
async fn drive(
    tool: String,
    command: String,
    prompt: String,
    timeout: Duration,
    tx: mpsc::Sender<StreamEvent>,
) {
    let mut child = match Command::new(&command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(tool = %tool, command = %command, error = %e, "Failed to spawn tool");
            let _ = tx
                .send(StreamEvent::Error(format!("failed to spawn {command}: {e}")))
                .await;
            return;
        }
    };

    let pid = child.id();
    tracing::info!(tool = %tool, pid = ?pid, "Tool process started");

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            // A tool that exits without reading its input is not an error.
            let _ = stdin.write_all(prompt.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });
    }

    let (chunk_tx, mut chunks) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    spawn_reader(child.stdout.take(), StreamEvent::Stdout, chunk_tx.clone());
    spawn_reader(child.stderr.take(), StreamEvent::Stderr, chunk_tx);

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut output_closed = false;
    // A chunk waiting for room in the caller's queue. Delivery races the
    // deadline so a caller that stops reading cannot stall the timeout.
    let mut pending: Option<StreamEvent> = None;

    let terminal = loop {
        tokio::select! {
            permit = tx.reserve(), if pending.is_some() => match permit {
                Ok(permit) => {
                    if let Some(event) = pending.take() {
                        permit.send(event);
                    }
                }
                Err(_) => {
                    tracing::debug!(tool = %tool, pid = ?pid, "Caller went away, stopping tool");
                    terminate(child, pid);
                    return;
                }
            },
            chunk = chunks.recv(), if pending.is_none() && !output_closed => match chunk {
                Some(event) => pending = Some(event),
                None => output_closed = true,
            },
            status = child.wait(), if pending.is_none() && output_closed => {
                break match status {
                    Ok(status) => {
                        tracing::info!(tool = %tool, pid = ?pid, code = ?status.code(), "Tool process exited");
                        StreamEvent::exit(status.code())
                    }
                    Err(e) => {
                        tracing::warn!(tool = %tool, pid = ?pid, error = %e, "Failed to wait for tool");
                        StreamEvent::Error(format!("failed to wait for {command}: {e}"))
                    }
                };
            }
            _ = &mut deadline => {
                tracing::warn!(tool = %tool, pid = ?pid, timeout_ms = timeout.as_millis() as u64, "Tool timed out");
                terminate(child, pid);
                break StreamEvent::Error(TIMEOUT_MESSAGE.to_string());
            }
            _ = tx.closed() => {
                tracing::debug!(tool = %tool, pid = ?pid, "Caller went away, stopping tool");
                terminate(child, pid);
                return;
            }
        }
    };

    let _ = tx.send(terminal).await;
}

/// Send SIGTERM, then kill outright if the process outlives the grace period.
fn terminate(mut child: Child, pid: Option<u32>) {
    let signalled = pid
        .and_then(|pid| i32::try_from(pid).ok())
        .map(|pid| kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok())
        .unwrap_or(false);
    if !signalled {
        let _ = child.start_kill();
    }

    tokio::spawn(async move {
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
            tracing::debug!(pid = ?pid, "Tool ignored SIGTERM, killing");
            let _ = child.kill().await;
        }
    });
}

/// Forward a child pipe as events, holding back split UTF-8 sequences.
fn spawn_reader<R>(reader: Option<R>, wrap: fn(String) -> StreamEvent, tx: mpsc::Sender<StreamEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(mut reader) = reader else {
        return;
    };

    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut carry: Vec<u8> = Vec::new();

        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    carry.extend_from_slice(&buf[..n]);
                    let keep = incomplete_utf8_tail(&carry);
                    let tail = carry.split_off(carry.len() - keep);
                    let chunk = std::mem::replace(&mut carry, tail);
                    if chunk.is_empty() {
                        continue;
                    }
                    let text = String::from_utf8_lossy(&chunk).into_owned();
                    if tx.send(wrap(text)).await.is_err() {
                        return;
                    }
                }
            }
        }

        if !carry.is_empty() {
            let _ = tx
                .send(wrap(String::from_utf8_lossy(&carry).into_owned()))
                .await;
        }
    });
}
