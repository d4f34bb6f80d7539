//! In-process transports and cluster harness for tests
//!
//! - [`LoopbackNetwork`] routes sends between services in one process,
//!   through the real frame codec, with a per-node online switch.
//! - [`ScriptedTransport`] parks every send until the test answers it.
//! - [`TestCluster`] wires several services sharing one log.

use crate::name::GclName;
use crate::replication::protocol::{Envelope, ReplicationMessage};
use crate::replication::{CommandRouter, ReplicationConfig, ReplicationService, Transport};
use crate::store::MemoryStore;
use crate::{Error, Gcl, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

struct Node {
    router: Option<CommandRouter>,
    online: bool,
}

/// In-process network of replication services
#[derive(Default)]
pub struct LoopbackNetwork {
    nodes: RwLock<HashMap<GclName, Node>>,
}

impl LoopbackNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport for `local`; the node starts online without a router
    pub fn transport(self: &Arc<Self>, local: GclName) -> Arc<LoopbackTransport> {
        self.nodes.write().entry(local).or_insert(Node {
            router: None,
            online: true,
        });
        Arc::new(LoopbackTransport {
            local,
            network: Arc::downgrade(self),
        })
    }

    /// Attach the router answering frames addressed to `name`
    pub fn register(&self, name: GclName, router: CommandRouter) {
        let mut nodes = self.nodes.write();
        let node = nodes.entry(name).or_insert(Node {
            router: None,
            online: true,
        });
        node.router = Some(router);
    }

    /// Take a node off the network or bring it back. An offline node can
    /// neither send nor receive.
    pub fn set_online(&self, name: GclName, online: bool) {
        if let Some(node) = self.nodes.write().get_mut(&name) {
            node.online = online;
        }
        tracing::debug!(node = %name, online, "loopback node state changed");
    }

    /// True if `name` is registered and online
    pub fn is_online(&self, name: &GclName) -> bool {
        self.nodes.read().get(name).is_some_and(|n| n.online)
    }

    fn route(&self, from: GclName, to: GclName) -> Result<CommandRouter> {
        let nodes = self.nodes.read();
        if !nodes.get(&from).is_some_and(|n| n.online) {
            return Err(Error::unreachable(to, "local node offline"));
        }
        match nodes.get(&to) {
            Some(Node {
                router: Some(router),
                online: true,
            }) => Ok(router.clone()),
            Some(_) => Err(Error::unreachable(to, "node offline")),
            None => Err(Error::unreachable(to, "no such node")),
        }
    }
}

/// Sending side of one [`LoopbackNetwork`] node
pub struct LoopbackTransport {
    local: GclName,
    network: Weak<LoopbackNetwork>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn local_name(&self) -> GclName {
        self.local
    }

    async fn send(&self, to: GclName, message: ReplicationMessage) -> Result<ReplicationMessage> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| Error::unreachable(to, "network dropped"))?;
        let router = network.route(self.local, to)?;
        drop(network);

        // through the codec, as on the wire
        let request = Envelope::decode(&Envelope::new(self.local, to, message).encode()?)?;
        tokio::task::yield_now().await;
        let response = router.dispatch(request.src, request.message).await;
        let response = Envelope::decode(&Envelope::new(to, self.local, response).encode()?)?;
        Ok(response.message)
    }
}

/// One send parked by a [`ScriptedTransport`]
#[derive(Debug)]
pub struct ScriptedSend {
    /// Destination
    pub to: GclName,
    /// Message sent
    pub message: ReplicationMessage,
    reply: oneshot::Sender<Result<ReplicationMessage>>,
}

impl ScriptedSend {
    /// Complete the send with `response`
    pub fn respond(self, response: Result<ReplicationMessage>) {
        let _ = self.reply.send(response);
    }
}

/// Transport whose sends complete only when the test answers them
pub struct ScriptedTransport {
    local: GclName,
    sends: mpsc::UnboundedSender<ScriptedSend>,
}

impl ScriptedTransport {
    /// Create a transport and the queue its sends arrive on
    pub fn new(local: GclName) -> (Arc<Self>, mpsc::UnboundedReceiver<ScriptedSend>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { local, sends: tx }), rx)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn local_name(&self) -> GclName {
        self.local
    }

    async fn send(&self, to: GclName, message: ReplicationMessage) -> Result<ReplicationMessage> {
        let (reply, response) = oneshot::channel();
        self.sends
            .send(ScriptedSend { to, message, reply })
            .map_err(|_| Error::unreachable(to, "script closed"))?;
        response
            .await
            .map_err(|_| Error::unreachable(to, "send abandoned by script"))?
    }
}

/// One server of a [`TestCluster`]
pub struct TestNode {
    /// Server identity
    pub name: GclName,
    /// Replication service
    pub service: Arc<ReplicationService>,
    /// Store behind the shared log
    pub store: Arc<MemoryStore>,
    /// Shared log as opened on this server
    pub gcl: Arc<Gcl>,
}

/// Several services on one [`LoopbackNetwork`], all replicating one log
pub struct TestCluster {
    /// Network connecting the nodes
    pub network: Arc<LoopbackNetwork>,
    /// Nodes in creation order
    pub nodes: Vec<TestNode>,
    /// Shared log
    pub log: GclName,
}

impl TestCluster {
    /// Build a cluster of `names`. Every node lists every other node as a
    /// replica; `config` supplies the rest. Periodic sync is disabled so
    /// tests drive beacons explicitly.
    pub fn new(names: &[&str], config: ReplicationConfig) -> Result<Self> {
        let network = LoopbackNetwork::new();
        let log = GclName::from_human("test-log");
        let peers: Vec<GclName> = names.iter().map(|n| GclName::from_human(n)).collect();
        let config = config
            .with_peers(peers.clone())
            .with_sync_interval(Duration::ZERO);

        let mut nodes = Vec::with_capacity(peers.len());
        for name in peers {
            let service = ReplicationService::new(config.clone(), network.transport(name))?;
            network.register(name, service.router());
            let store = Arc::new(MemoryStore::new());
            let gcl = service.open_log(log, store.clone());
            nodes.push(TestNode {
                name,
                service,
                store,
                gcl,
            });
        }

        Ok(Self {
            network,
            nodes,
            log,
        })
    }

    /// Node by index
    pub fn node(&self, i: usize) -> &TestNode {
        &self.nodes[i]
    }

    /// Switch node `i` online or offline
    pub fn set_online(&self, i: usize, online: bool) {
        self.network.set_online(self.nodes[i].name, online);
    }
}

/// Poll `check` until it holds or `timeout` passes; returns the last result
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::protocol::ReplicationMessageType;

    #[tokio::test]
    async fn test_loopback_ping_and_offline() {
        let cluster = TestCluster::new(&["a", "b"], ReplicationConfig::default()).unwrap();
        let a = cluster.node(0);
        let b = cluster.node(1).name;

        let pong = a
            .service
            .transport()
            .send(b, ReplicationMessage::Ping { timestamp: 9 })
            .await
            .unwrap();
        assert_eq!(pong, ReplicationMessage::Pong { timestamp: 9 });

        cluster.set_online(1, false);
        assert!(!cluster.network.is_online(&b));
        let err = a
            .service
            .transport()
            .send(b, ReplicationMessage::Ping { timestamp: 9 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_scripted_send_is_parked_until_answered() {
        let (transport, mut sends) = ScriptedTransport::new(GclName::from_human("me"));
        let peer = GclName::from_human("peer");
        let pending = tokio::spawn({
            let transport = transport.clone();
            async move { transport.send(peer, ReplicationMessage::Ping { timestamp: 1 }).await }
        });

        let send = sends.recv().await.unwrap();
        assert_eq!(send.to, peer);
        assert_eq!(send.message.message_type(), ReplicationMessageType::Ping);
        send.respond(Ok(ReplicationMessage::Pong { timestamp: 1 }));
        assert_eq!(
            pending.await.unwrap().unwrap(),
            ReplicationMessage::Pong { timestamp: 1 }
        );
    }
}
