//! GCL Server - log server daemon
//!
//! Hosts replicated logs over TCP:
//! - Append from writers, answered once the ack quorum is met
//! - ForwardAppend / FetchRecord / SyncBeacon between replica servers
//! - Periodic anti-entropy in the background

use gcl_core::replication::{ReplicationService, TcpTransport, serve};
use gcl_core::{GclName, MemoryStore};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub mod config;

pub use config::{Config, ConfigError};

/// Server startup errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Replication engine error
    #[error(transparent)]
    Core(#[from] gcl_core::Error),

    /// Listener error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running log server
pub struct GclServer {
    name: GclName,
    local_addr: SocketAddr,
    service: Arc<ReplicationService>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    listener: Option<JoinHandle<gcl_core::Result<()>>>,
}

impl GclServer {
    /// Bind the configured address and start serving
    pub async fn start(config: Config) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind).await?;
        Self::start_with_listener(config, listener).await
    }

    /// Start serving on an already bound listener
    pub async fn start_with_listener(config: Config, listener: TcpListener) -> Result<Self, ServerError> {
        config.validate()?;
        let name = config.server_name()?;
        let local_addr = listener.local_addr()?;

        let transport = Arc::new(TcpTransport::new(name, config.route_table()?));
        let service = ReplicationService::new(config.replication.clone(), transport)?;

        for log in config.log_names()? {
            service.open_log(log, Arc::new(MemoryStore::new()));
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let router = service.router();
        let listener = tokio::spawn(serve(listener, name, router, shutdown_rx));
        service.start_sync_loop();

        tracing::info!(
            server = %name,
            addr = %local_addr,
            logs = config.logs.len(),
            "GCL server started"
        );

        Ok(Self {
            name,
            local_addr,
            service,
            shutdown_tx: Some(shutdown_tx),
            listener: Some(listener),
        })
    }

    /// Server identity
    pub fn name(&self) -> GclName {
        self.name
    }

    /// Bound listen address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Replication service
    pub fn service(&self) -> &Arc<ReplicationService> {
        &self.service
    }

    /// Stop the listener and background sync
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(listener) = self.listener.take() {
            match listener.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "listener exited with error"),
                Err(e) => tracing::warn!(error = %e, "listener task failed"),
            }
        }
        self.service.shutdown().await;
        tracing::info!(server = %self.name, "GCL server stopped");
    }
}
