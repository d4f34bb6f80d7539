//! TCP transport
//!
//! Frames are [`Envelope`]s in the replication wire format. Each peer gets
//! one pooled connection used in lockstep: write a request, read its
//! response. A connection that fails or is cancelled mid-exchange is
//! dropped and redialed on the next send.

use crate::name::GclName;
use crate::replication::protocol::{Envelope, ReplicationMessage, nak};
use crate::replication::router::CommandRouter;
use crate::replication::transport::Transport;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

/// Default connect deadline
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default deadline for one request/response exchange
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Connection = Arc<tokio::sync::Mutex<Option<TcpStream>>>;

/// [`Transport`] over TCP with a static route table
pub struct TcpTransport {
    local: GclName,
    routes: RwLock<HashMap<GclName, SocketAddr>>,
    connections: Mutex<HashMap<GclName, Connection>>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl TcpTransport {
    /// Create a transport for `local` with `routes` to its peers
    pub fn new(local: GclName, routes: HashMap<GclName, SocketAddr>) -> Self {
        Self {
            local,
            routes: RwLock::new(routes),
            connections: Mutex::new(HashMap::new()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set connect and request deadlines
    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }

    /// Add or replace the route to `peer`; an open connection to the old
    /// address is dropped.
    pub fn add_route(&self, peer: GclName, addr: SocketAddr) {
        self.routes.write().insert(peer, addr);
        self.connections.lock().remove(&peer);
    }

    fn route(&self, peer: &GclName) -> Option<SocketAddr> {
        self.routes.read().get(peer).copied()
    }

    fn connection(&self, peer: GclName) -> Connection {
        self.connections.lock().entry(peer).or_default().clone()
    }

    async fn exchange(&self, stream: &mut TcpStream, request: &Envelope) -> Result<Envelope> {
        request.write_to(stream).await?;
        tokio::time::timeout(self.request_timeout, Envelope::read_from(stream))
            .await
            .map_err(|_| Error::unreachable(request.dst, "request timed out"))?
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_name(&self) -> GclName {
        self.local
    }

    async fn send(&self, to: GclName, message: ReplicationMessage) -> Result<ReplicationMessage> {
        let addr = self
            .route(&to)
            .ok_or_else(|| Error::unreachable(to, "no route"))?;
        let connection = self.connection(to);
        let mut slot = connection.lock().await;

        // out of the slot until a full response is read; a send cancelled
        // mid-exchange drops the connection with its unread response
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => {
                let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| Error::unreachable(to, "connection timeout"))?
                    .map_err(|e| Error::unreachable(to, e.to_string()))?;
                stream.set_nodelay(true)?;
                tracing::debug!(peer = %to, %addr, "connected to peer");
                stream
            }
        };

        let request = Envelope::new(self.local, to, message);
        match self.exchange(&mut stream, &request).await {
            Ok(response) => {
                *slot = Some(stream);
                if response.src != to {
                    tracing::warn!(peer = %to, answered_by = %response.src, "response from unexpected server");
                }
                Ok(response.message)
            }
            Err(e) => {
                tracing::debug!(peer = %to, error = %e, "dropping connection");
                Err(match e {
                    Error::Io(io) => Error::unreachable(to, io.to_string()),
                    other => other,
                })
            }
        }
    }
}

/// Accept connections on `listener` and answer every frame through
/// `router` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    local: GclName,
    router: CommandRouter,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    let router = Arc::new(router);
    let mut connections = JoinSet::new();
    tracing::info!(server = %local, addr = ?listener.local_addr().ok(), "listening for peers");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let router = router.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, local, router).await {
                                tracing::debug!(%addr, error = %e, "peer connection closed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept error");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut shutdown => {
                tracing::info!(server = %local, "listener shutting down");
                break;
            }
        }
    }

    connections.shutdown().await;
    Ok(())
}

async fn handle_connection(mut stream: TcpStream, local: GclName, router: Arc<CommandRouter>) -> Result<()> {
    stream.set_nodelay(true)?;
    loop {
        let request = match Envelope::read_from(&mut stream).await {
            Ok(envelope) => envelope,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        let response = if request.dst != local {
            tracing::warn!(src = %request.src, dst = %request.dst, "misdirected frame");
            ReplicationMessage::Error {
                code: nak::BAD_REQUEST,
                message: format!("this server is {}, not {}", local, request.dst),
            }
        } else {
            router.dispatch(request.src, request.message).await
        };

        Envelope::new(local, request.src, response)
            .write_to(&mut stream)
            .await?;
    }
}
