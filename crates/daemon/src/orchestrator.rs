//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that builds the session
//! registry, the tool invoker and the HTTP router from a [`Config`], serves
//! them on a TCP listener, and tears everything down on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::http::{self, AppState};
use crate::invoke::StreamingInvoker;
use crate::session::{
    NativePtySpawner, PtySpawner, SessionMultiplexer, SessionRegistry, SessionSettings,
    SHUTDOWN_TIMEOUT,
};

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Live PTY sessions.
    registry: Arc<SessionRegistry>,
    /// Shared handler state.
    state: Arc<AppState>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
}

impl DaemonOrchestrator {
    /// Creates an orchestrator that spawns shells on native PTYs.
    pub fn new(config: Config) -> Self {
        let spawner = Arc::new(NativePtySpawner::new(config.session.term.clone()));
        Self::with_spawner(config, spawner)
    }

    /// Creates an orchestrator with a custom PTY spawner.
    pub fn with_spawner(config: Config, spawner: Arc<dyn PtySpawner>) -> Self {
        let registry = SessionRegistry::new(spawner, SessionSettings::from(&config.session));

        let state = Arc::new(AppState {
            invoker: StreamingInvoker::from_config(&config.invoke),
            multiplexer: SessionMultiplexer::new(
                Arc::clone(&registry),
                config.session.adopt_client_ids,
            ),
            ui_path: config.server.ui_path.clone(),
        });

        Self {
            config,
            registry,
            state,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Build the HTTP router.
    pub fn router(&self) -> axum::Router {
        http::router(Arc::clone(&self.state), self.config.invoke.max_body_bytes)
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.config.server.bind, self.config.server.port);
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))
    }

    /// Serve on the configured address until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve on `listener` until the shutdown token is cancelled, then
    /// terminate every session.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr: SocketAddr = listener.local_addr().context("Failed to read local address")?;
        info!(
            addr = %addr,
            shell = %self.config.session.shell,
            cwd = %self.config.session.cwd.display(),
            "Agent worker listening"
        );

        let token = self.shutdown_token.clone();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .context("HTTP server failed");

        self.registry.shutdown(SHUTDOWN_TIMEOUT).await;
        info!("Agent worker stopped");
        result
    }

    /// Signal shutdown.
    pub fn stop(&self) {
        info!("Stopping agent worker");
        self.shutdown_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::MockSpawner;
    use std::time::Duration;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.bind = "127.0.0.1".to_string();
        config.server.port = 0;
        config
    }

    #[tokio::test]
    async fn test_serve_and_stop() {
        let spawner = MockSpawner::new();
        let orchestrator = Arc::new(DaemonOrchestrator::with_spawner(test_config(), spawner.clone()));
        let listener = orchestrator.bind().await.unwrap();

        orchestrator.registry().get_or_create("abc", 80, 24).await.unwrap();

        let server = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.serve(listener).await })
        };

        orchestrator.stop();
        let result = tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());

        // Shutdown drains the registry.
        assert_eq!(orchestrator.registry().count(), 0);
        assert_eq!(spawner.process(0).kills(), 1);
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let mut config = test_config();
        config.server.bind = "256.0.0.1".to_string();
        let orchestrator = DaemonOrchestrator::with_spawner(config, MockSpawner::new());
        assert!(orchestrator.bind().await.is_err());
    }
}
