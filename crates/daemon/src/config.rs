//! Configuration management for the Agent Worker daemon.
//!
//! This module provides TOML-based configuration file loading with
//! environment variable overrides. The default configuration path is
//! `~/.config/agent-worker/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("request_timeout_ms must be greater than 0")]
    InvalidRequestTimeout,

    #[error("max_body_bytes must be greater than 0")]
    InvalidMaxBodyBytes,

    #[error("ttl_ms must be greater than 0")]
    InvalidSessionTtl,

    #[error("max_buffer_bytes must be greater than 0")]
    InvalidMaxBufferBytes,

    #[error("tool {0:?} must map to a non-empty command")]
    InvalidToolCommand(String),

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Agent Worker daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP listener configuration.
    pub server: ServerConfig,

    /// One-shot tool invocation configuration.
    pub invoke: InvokeConfig,

    /// PTY session configuration.
    pub session: SessionConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind: String,

    /// TCP port to listen on.
    pub port: u16,

    /// Path of the static UI document served at `/`.
    pub ui_path: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// One-shot tool invocation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InvokeConfig {
    /// Wall-clock limit for a single invocation, in milliseconds.
    pub request_timeout_ms: u64,

    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,

    /// Tool name to executable mapping.
    pub tools: BTreeMap<String, String>,
}

/// PTY session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell executable spawned for every session.
    pub shell: String,

    /// Working directory for new sessions.
    pub cwd: PathBuf,

    /// How long a detached session survives, in milliseconds.
    pub ttl_ms: u64,

    /// Maximum bytes of output retained per session for replay.
    pub max_buffer_bytes: usize,

    /// Value of `TERM` in the session environment.
    pub term: String,

    /// Create sessions under unknown client-supplied ids instead of issuing a
    /// fresh id.
    pub adopt_client_ids: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            ui_path: PathBuf::from("static/index.html"),
            log_level: "info".to_string(),
        }
    }
}

impl Default for InvokeConfig {
    fn default() -> Self {
        let mut tools = BTreeMap::new();
        tools.insert("claude".to_string(), "claude".to_string());
        tools.insert("codex".to_string(), "codex".to_string());

        Self {
            request_timeout_ms: 120_000,
            max_body_bytes: 256 * 1024,
            tools,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            cwd: default_cwd(),
            ttl_ms: 300_000, // 5 minutes
            max_buffer_bytes: 200_000,
            term: "xterm-256color".to_string(),
            adopt_client_ids: false,
        }
    }
}

impl InvokeConfig {
    /// The invocation timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl SessionConfig {
    /// The idle TTL as a [`Duration`].
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agent-worker")
        .join("config.toml")
}

/// Returns the default session working directory.
///
/// `/workspace` when it exists (container deployments), otherwise the home
/// directory.
fn default_cwd() -> PathBuf {
    let workspace = PathBuf::from("/workspace");
    if workspace.is_dir() {
        return workspace;
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

/// Read a non-empty environment variable.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Read and parse a numeric environment variable, logging bad values.
fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_value(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}: {:?} is not a valid number", name, raw);
            None
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PORT: Listening port
    /// - AW_REQUEST_TIMEOUT_MS: Invocation timeout
    /// - AW_MAX_BODY_BYTES: Request body limit
    /// - AW_SHELL: Session shell
    /// - AW_SHELL_CWD: Session working directory
    /// - AW_PTY_TTL_MS: Idle session TTL
    /// - AW_PTY_MAX_BUFFER: Replay buffer size
    /// - AW_LOG_LEVEL: Log level
    /// - AW_UI_PATH: Static UI document
    /// - CLAUDE_CMD / CODEX_CMD: Executables for the built-in tools
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = env_number("PORT") {
            tracing::info!("Overriding port from environment: {}", port);
            self.server.port = port;
        }

        if let Some(timeout) = env_number("AW_REQUEST_TIMEOUT_MS") {
            self.invoke.request_timeout_ms = timeout;
        }

        if let Some(limit) = env_number("AW_MAX_BODY_BYTES") {
            self.invoke.max_body_bytes = limit;
        }

        if let Some(shell) = env_value("AW_SHELL") {
            tracing::info!("Overriding shell from environment: {}", shell);
            self.session.shell = shell;
        }

        if let Some(cwd) = env_value("AW_SHELL_CWD") {
            self.session.cwd = PathBuf::from(cwd);
        }

        if let Some(ttl) = env_number("AW_PTY_TTL_MS") {
            self.session.ttl_ms = ttl;
        }

        if let Some(size) = env_number("AW_PTY_MAX_BUFFER") {
            self.session.max_buffer_bytes = size;
        }

        if let Some(level) = env_value("AW_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.server.log_level = level;
        }

        if let Some(path) = env_value("AW_UI_PATH") {
            self.server.ui_path = PathBuf::from(path);
        }

        for (tool, var) in [("claude", "CLAUDE_CMD"), ("codex", "CODEX_CMD")] {
            if let Some(command) = env_value(var) {
                self.invoke.tools.insert(tool.to_string(), command);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.invoke.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidRequestTimeout);
        }

        if self.invoke.max_body_bytes == 0 {
            return Err(ConfigError::InvalidMaxBodyBytes);
        }

        if self.session.ttl_ms == 0 {
            return Err(ConfigError::InvalidSessionTtl);
        }

        if self.session.max_buffer_bytes == 0 {
            return Err(ConfigError::InvalidMaxBufferBytes);
        }

        for (tool, command) in &self.invoke.tools {
            if command.trim().is_empty() {
                return Err(ConfigError::InvalidToolCommand(tool.clone()));
            }
        }

        // Validate shell path exists
        let shell_path = Path::new(&self.session.shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
            }
        } else if which::which(&self.session.shell).is_err() {
            return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
