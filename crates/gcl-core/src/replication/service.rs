//! Replication service
//!
//! One per server. Holds the open logs and wires the forward coordinator,
//! the sync engine and the command handlers to a single transport.

use crate::name::GclName;
use crate::record::{RecNo, Record};
use crate::replication::config::{GapPolicy, ReplicationConfig};
use crate::replication::forward::{ForwardCoordinator, ForwardHandle, WriteReceipt};
use crate::replication::handlers;
use crate::replication::protocol::nak;
use crate::replication::router::CommandRouter;
use crate::replication::stats::{ReplicationStats, StatsHandle};
use crate::replication::sync::{SyncEngine, SyncLoop};
use crate::replication::transport::Transport;
use crate::store::RecordStore;
use crate::{Error, Gcl, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Replication engine for every log open on this server
pub struct ReplicationService {
    local: GclName,
    config: ReplicationConfig,
    transport: Arc<dyn Transport>,
    logs: RwLock<HashMap<GclName, Arc<Gcl>>>,
    forward: ForwardCoordinator,
    sync: SyncEngine,
    stats: StatsHandle,
    sync_loop: Mutex<Option<SyncLoop>>,
}

impl ReplicationService {
    /// Create a service sending through `transport`
    pub fn new(config: ReplicationConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        config.validate()?;
        let stats = StatsHandle::default();
        let local = transport.local_name();

        tracing::info!(
            server = %local,
            peers = config.peers.len(),
            ack_quorum = config.ack_quorum,
            gap_policy = ?config.gap_policy,
            "replication service created"
        );

        Ok(Arc::new(Self {
            local,
            forward: ForwardCoordinator::new(transport.clone(), config.clone(), stats.clone()),
            sync: SyncEngine::new(transport.clone(), config.clone(), stats.clone()),
            config,
            transport,
            logs: RwLock::new(HashMap::new()),
            stats,
            sync_loop: Mutex::new(None),
        }))
    }

    /// Open `name` over `store` with the configured replica set. Opening a
    /// log twice returns the existing handle.
    pub fn open_log(&self, name: GclName, store: Arc<dyn RecordStore>) -> Arc<Gcl> {
        let mut logs = self.logs.write();
        if let Some(existing) = logs.get(&name) {
            tracing::debug!(log = %name, "log already open");
            return existing.clone();
        }
        let gcl = Gcl::open(name, store, &self.config.peers, &self.local);
        logs.insert(name, gcl.clone());
        gcl
    }

    /// Close a log. Forwards already in flight still resolve.
    pub fn close_log(&self, name: &GclName) -> Option<Arc<Gcl>> {
        let closed = self.logs.write().remove(name);
        if closed.is_some() {
            tracing::info!(log = %name, "log closed");
        }
        closed
    }

    /// Handle of an open log
    pub fn log(&self, name: &GclName) -> Result<Arc<Gcl>> {
        self.logs
            .read()
            .get(name)
            .cloned()
            .ok_or(Error::UnknownLog(*name))
    }

    /// All open logs
    pub fn logs(&self) -> Vec<Arc<Gcl>> {
        self.logs.read().values().cloned().collect()
    }

    /// Commit `data` locally, forward it, and wait for the quorum verdict.
    ///
    /// A quorum error means the record is durable here but not confirmed on
    /// enough replicas; any other error means the local commit failed.
    pub async fn append(&self, log: &GclName, data: Vec<u8>) -> Result<WriteReceipt> {
        let gcl = self.log(log)?;
        let record = self.commit(&gcl, data)?;
        self.forward_append(&gcl, record).wait().await
    }

    /// Local half of an append
    pub fn commit(&self, gcl: &Gcl, data: Vec<u8>) -> Result<Record> {
        let record = gcl.store().append(data)?;
        self.stats.update(|s| s.local_appends += 1);
        tracing::debug!(log = %gcl.name(), recno = record.recno, "record committed locally");
        Ok(record)
    }

    /// Forward a locally committed record to the log's replicas
    pub fn forward_append(&self, gcl: &Arc<Gcl>, record: Record) -> ForwardHandle {
        self.forward.forward_append(gcl, record)
    }

    /// Store a record forwarded by `source`, repairing any gap in front of
    /// it according to the gap policy. Returns the stored record number.
    pub async fn accept_forwarded(&self, log: GclName, source: GclName, record: Record) -> Result<RecNo> {
        let gcl = self.log(&log)?;
        let recno = record.recno;
        if recno == 0 {
            return Err(Error::Nak {
                code: nak::FORBIDDEN,
                message: "record number 0 is reserved".into(),
            });
        }

        if gcl.store().contains(recno) {
            return self.accept_existing(&gcl, &record);
        }

        let high_water = gcl.high_water_mark();
        if recno > high_water + 1 {
            self.stats.update(|s| s.gaps_detected += 1);
            tracing::info!(
                log = %log,
                recno,
                high_water,
                source = %source,
                policy = ?self.config.gap_policy,
                "forwarded record ahead of local log"
            );

            match self.config.gap_policy {
                GapPolicy::Block => {
                    let report = self.sync.reactive_sync(&gcl, source, recno).await;
                    if !report.is_complete() {
                        tracing::warn!(
                            log = %log,
                            recno,
                            unavailable = ?report.unavailable,
                            "accepting record with gap unrepaired"
                        );
                    }
                }
                GapPolicy::Backfill => {
                    let sync = self.sync.clone();
                    let gcl = gcl.clone();
                    tokio::spawn(async move {
                        sync.reactive_sync(&gcl, source, recno).await;
                    });
                }
            }
        }

        match gcl.store().insert(record.clone()) {
            Ok(()) => {}
            // sync or a retried forward got there first
            Err(Error::Duplicate(_)) => return self.accept_existing(&gcl, &record),
            Err(e) => return Err(e),
        }

        self.stats.update(|s| s.forwarded_accepted += 1);
        tracing::debug!(log = %log, recno, source = %source, "forwarded record stored");
        Ok(recno)
    }

    fn accept_existing(&self, gcl: &Gcl, record: &Record) -> Result<RecNo> {
        let existing = gcl.store().read(record.recno)?;
        if existing.same_content(record) {
            tracing::debug!(log = %gcl.name(), recno = record.recno, "forwarded record already present");
            Ok(record.recno)
        } else {
            tracing::warn!(log = %gcl.name(), recno = record.recno, "forwarded record conflicts with local copy");
            Err(Error::Duplicate(record.recno))
        }
    }

    /// Read one record from an open log
    pub fn read(&self, log: &GclName, recno: RecNo) -> Result<Record> {
        self.log(log)?.store().read(recno)
    }

    /// Command router for inbound frames, built once per listener
    pub fn router(self: &Arc<Self>) -> CommandRouter {
        handlers::routes(self)
    }

    /// Start the periodic beacon loop unless it is disabled or running
    pub fn start_sync_loop(self: &Arc<Self>) {
        let Some(interval) = self.config.sync_interval() else {
            tracing::info!("periodic sync disabled");
            return;
        };
        let mut sync_loop = self.sync_loop.lock();
        if sync_loop.is_none() {
            *sync_loop = Some(SyncLoop::spawn(self, interval));
        }
    }

    /// Stop background work
    pub async fn shutdown(&self) {
        let sync_loop = self.sync_loop.lock().take();
        if let Some(sync_loop) = sync_loop {
            sync_loop.stop().await;
        }
    }

    /// Anti-entropy engine
    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    /// Current counters
    pub fn stats(&self) -> ReplicationStats {
        self.stats.snapshot()
    }

    /// Replication configuration
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// This server's identity
    pub fn local_name(&self) -> GclName {
        self.local
    }

    /// Transport used for outbound sends
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}
