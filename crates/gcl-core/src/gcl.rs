//! Open log handle
//!
//! A [`Gcl`] owns its replica set and the table of in-flight forward
//! requests. Both live behind one mutex: every read-modify-write of ack
//! counters, the acked set, or the replica list happens under it, and the
//! guard is never held across an `.await`.

use crate::name::GclName;
use crate::record::RecNo;
use crate::replication::forward::{ForwardRequest, RequestId};
use crate::replication::replica_set::ReplicaSet;
use crate::store::RecordStore;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Mutable per-log replication state
#[derive(Default)]
pub(crate) struct GclState {
    pub(crate) replicas: ReplicaSet,
    pub(crate) in_flight: HashMap<RequestId, ForwardRequest>,
}

/// A log open on this server
pub struct Gcl {
    name: GclName,
    store: Arc<dyn RecordStore>,
    state: Mutex<GclState>,
}

impl Gcl {
    /// Open a log over `store`, loading its replica set from `peers`
    /// without `local`.
    pub fn open(
        name: GclName,
        store: Arc<dyn RecordStore>,
        peers: &[GclName],
        local: &GclName,
    ) -> Arc<Self> {
        let replicas = ReplicaSet::load(peers, local);
        tracing::info!(
            log = %name,
            replicas = replicas.len(),
            recno = store.max_recno(),
            "log opened"
        );
        Arc::new(Self {
            name,
            store,
            state: Mutex::new(GclState {
                replicas,
                in_flight: HashMap::new(),
            }),
        })
    }

    /// Log name
    pub fn name(&self) -> GclName {
        self.name
    }

    /// Record store behind this log
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Highest record number committed locally
    pub fn high_water_mark(&self) -> RecNo {
        self.store.max_recno()
    }

    /// Highest N with records 1..=N all present locally
    pub fn contiguous_recno(&self) -> RecNo {
        self.store.contiguous_recno()
    }

    /// Snapshot of the replica set
    pub fn replicas(&self) -> ReplicaSet {
        self.state.lock().replicas.clone()
    }

    /// Peer identities in configuration order
    pub fn replica_names(&self) -> Vec<GclName> {
        self.state.lock().replicas.names()
    }

    /// Add a replica at runtime
    pub fn add_replica(&self, name: GclName) -> bool {
        self.state.lock().replicas.add(name)
    }

    /// Remove a replica at runtime; forwards already issued to it still
    /// resolve normally
    pub fn remove_replica(&self, name: &GclName) -> bool {
        self.state.lock().replicas.remove(name)
    }

    /// Number of forward requests still holding bookkeeping
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, GclState> {
        self.state.lock()
    }
}

impl fmt::Debug for Gcl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gcl")
            .field("name", &self.name)
            .field("max_recno", &self.store.max_recno())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_open_loads_replicas_without_self() {
        let me = GclName::from_human("me");
        let peers = [GclName::from_human("a"), me, GclName::from_human("b")];
        let gcl = Gcl::open(
            GclName::from_human("log"),
            Arc::new(MemoryStore::new()),
            &peers,
            &me,
        );
        assert_eq!(gcl.replicas().len(), 2);
        assert!(!gcl.replicas().contains(&me));
        assert_eq!(gcl.in_flight(), 0);
        assert_eq!(gcl.high_water_mark(), 0);
    }

    #[test]
    fn test_runtime_reconfiguration() {
        let me = GclName::from_human("me");
        let gcl = Gcl::open(
            GclName::from_human("log"),
            Arc::new(MemoryStore::new()),
            &[],
            &me,
        );
        assert!(gcl.add_replica(GclName::from_human("c")));
        assert_eq!(gcl.replica_names(), vec![GclName::from_human("c")]);
        assert!(gcl.remove_replica(&GclName::from_human("c")));
        assert!(gcl.replicas().is_empty());
    }
}
