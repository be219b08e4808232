//! # Agent Worker Daemon Library
//!
//! This crate provides the server side of Agent Worker: remote, interactive
//! command execution over HTTP.
//!
//! ## Overview
//!
//! - **Tool Invocation**: run a configured executable with a prompt on
//!   stdin, either to completion or streamed as NDJSON events
//! - **Persistent Terminals**: PTY sessions bound to a websocket that
//!   survive disconnects, replay recent output on reattach, and are reclaimed
//!   after an idle timeout
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │                        HTTP Router (axum)                    │
//! │   /api/run  /api/run/stream          /ws/terminal    /*      │
//! │        │            │                      │          UI     │
//! │  ┌─────▼────────────▼─────┐   ┌────────────▼─────────────┐   │
//! │  │   Streaming Invoker    │   │   Session Multiplexer    │   │
//! │  │  (one driver task per  │   ├──────────────────────────┤   │
//! │  │     tool process)      │   │    Session Registry      │   │
//! │  └────────────────────────┘   │  (one actor per session) │   │
//! │                               ├──────────────────────────┤   │
//! │                               │   PTY process + buffer   │   │
//! │                               └──────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!
//!     let orchestrator = DaemonOrchestrator::new(config);
//!     orchestrator.run().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY sessions, registry and connection multiplexing
//! - [`invoke`]: One-shot tool invocation
//! - [`http`]: HTTP and websocket handlers
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod http;
pub mod invoke;
pub mod orchestrator;
pub mod session;

pub use config::{Config, ConfigError};
pub use invoke::{InvokeError, StreamingInvoker, ToolRegistry};
pub use orchestrator::DaemonOrchestrator;
pub use session::{SessionError, SessionMultiplexer, SessionRegistry};
