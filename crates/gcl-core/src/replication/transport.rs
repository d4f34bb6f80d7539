//! Transport seam between the replication engine and the network
//!
//! A send registers interest in exactly one response and never blocks the
//! caller's thread; the future resolves when the peer answers or the
//! transport gives up.

use crate::Result;
use crate::name::GclName;
use crate::replication::protocol::ReplicationMessage;
use async_trait::async_trait;

/// Request/response channel to other log servers
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identity of this server on the network
    fn local_name(&self) -> GclName;

    /// Send `message` to `to` and wait for its single response
    async fn send(&self, to: GclName, message: ReplicationMessage) -> Result<ReplicationMessage>;
}
