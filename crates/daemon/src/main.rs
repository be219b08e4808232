//! Agent Worker Daemon
//!
//! Serves one-shot tool runs and persistent terminal sessions over HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::orchestrator::DaemonOrchestrator;
use futures_util::StreamExt;
use protocol::{NdjsonDecoder, StreamEvent};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Agent Worker - remote tool execution and persistent terminals.
#[derive(Parser, Debug)]
#[command(name = "agent-worker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute (defaults to `serve`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the HTTP server
    Serve {
        /// Address to bind (overrides config)
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Run a tool on a remote worker and stream its output
    Invoke {
        /// Base URL of the worker
        #[arg(long, env = "AGENT_WORKER_URL", default_value = "http://127.0.0.1:3000")]
        url: String,

        /// Tool to run
        #[arg(long, short, default_value = "claude")]
        tool: String,

        /// Prompt written to the tool's stdin
        prompt: String,
    },

    /// Print the effective configuration
    Config {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Tracing comes first so config diagnostics are not lost
    let log_level = init_tracing(cli.verbose);
    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    if let Some(handle) = log_level {
        apply_log_level(&handle, &config.server.log_level);
    }

    match cli.command.unwrap_or(Commands::Serve {
        bind: None,
        port: None,
    }) {
        Commands::Serve { bind, port } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            config.validate()?;
            run_server(config).await?;
        }
        Commands::Invoke { url, tool, prompt } => {
            let code = run_invoke(&url, &tool, &prompt).await?;
            std::process::exit(code);
        }
        Commands::Config { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print!("{}", config.to_toml()?);
            }
        }
    }

    Ok(())
}

/// Filter fixed at startup by `RUST_LOG` or `--verbose`. `None` leaves the
/// level to the configuration.
fn pinned_filter(rust_log: Option<&str>, verbose: bool) -> Option<EnvFilter> {
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| verbose.then(|| EnvFilter::new("debug")))
}

/// Initialize tracing at `info` until the configured level is known.
///
/// Returns a handle for [`apply_log_level`], or `None` when `RUST_LOG` or
/// `--verbose` pinned the filter.
fn init_tracing(verbose: bool) -> Option<reload::Handle<EnvFilter, Registry>> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let pinned = pinned_filter(rust_log.as_deref(), verbose);
    let adjustable = pinned.is_none();

    let (filter, handle) = reload::Layer::new(pinned.unwrap_or_else(|| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    adjustable.then_some(handle)
}

/// Switch to the configured log level.
fn apply_log_level(handle: &reload::Handle<EnvFilter, Registry>, level: &str) {
    match EnvFilter::try_new(level) {
        Ok(filter) => {
            if let Err(e) = handle.reload(filter) {
                tracing::warn!(error = %e, "Failed to apply log level");
            }
        }
        Err(e) => tracing::warn!(level = %level, error = %e, "Ignoring invalid log level"),
    }
}

/// Serve until SIGINT/SIGTERM, then drain sessions.
async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("Agent worker starting...");

    let orchestrator = Arc::new(DaemonOrchestrator::new(config));
    let listener = orchestrator.bind().await?;

    let mut server = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.serve(listener).await })
    };

    tokio::select! {
        result = &mut server => {
            return result.context("Server task failed")?;
        }
        signal = wait_for_shutdown_signal() => {
            signal?;
            tracing::info!("Received shutdown signal");
            orchestrator.stop();
        }
    }

    server.await.context("Server task failed")?
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Stream a remote tool run to the local stdout/stderr.
///
/// Returns the process exit code to use: the remote code, or 1 when the run
/// failed or the code is unknown.
async fn run_invoke(url: &str, tool: &str, prompt: &str) -> anyhow::Result<i32> {
    let endpoint = format!("{}/api/run/stream", url.trim_end_matches('/'));

    let response = reqwest::Client::new()
        .post(&endpoint)
        .json(&serde_json::json!({ "tool": tool, "prompt": prompt }))
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", endpoint))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("{} returned {}: {}", endpoint, status, body.trim());
    }

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut decoder = NdjsonDecoder::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("Failed to read response stream")?;
        for event in decoder.decode::<StreamEvent>(&chunk)? {
            if let Some(code) = emit_event(&event, &mut stdout, &mut stderr).await? {
                return Ok(code);
            }
        }
    }

    if let Some(event) = decoder.finish::<StreamEvent>()? {
        if let Some(code) = emit_event(&event, &mut stdout, &mut stderr).await? {
            return Ok(code);
        }
    }

    bail!("Stream ended without an exit event")
}

/// Write one event locally. Returns the exit code for terminal events.
async fn emit_event<O, E>(event: &StreamEvent, stdout: &mut O, stderr: &mut E) -> anyhow::Result<Option<i32>>
where
    O: tokio::io::AsyncWrite + Unpin,
    E: tokio::io::AsyncWrite + Unpin,
{
    match event {
        StreamEvent::Stdout(data) => {
            stdout.write_all(data.as_bytes()).await?;
            stdout.flush().await?;
            Ok(None)
        }
        StreamEvent::Stderr(data) => {
            stderr.write_all(data.as_bytes()).await?;
            stderr.flush().await?;
            Ok(None)
        }
        StreamEvent::Exit(code) => Ok(Some(exit_code(code))),
        StreamEvent::Error(message) => {
            stderr
                .write_all(format!("agent-worker: {}\n", message).as_bytes())
                .await?;
            stderr.flush().await?;
            Ok(Some(1))
        }
    }
}

/// Local exit code for a remote `exit` event payload.
fn exit_code(data: &str) -> i32 {
    data.trim().parse().unwrap_or(1)
}
