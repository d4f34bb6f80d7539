//! Replication counters

use parking_lot::Mutex;
use std::sync::Arc;

/// Replication statistics for one server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    /// Records committed locally on behalf of writers
    pub local_appends: u64,
    /// Forward-append sends issued
    pub forwards_sent: u64,
    /// Forwards resolved without an ack (NAK, send error, end of stream)
    pub forward_failures: u64,
    /// Distinct acknowledgments counted
    pub acks_received: u64,
    /// Acknowledgments repeated by a replica that already answered
    pub duplicate_acks: u64,
    /// Responses with no matching in-flight request or replica
    pub ignored_acks: u64,
    /// Success replies delivered to writers
    pub replies_sent: u64,
    /// Quorum timeouts and unreachable-quorum verdicts
    pub quorum_failures: u64,
    /// Forward requests whose bookkeeping was released
    pub requests_released: u64,
    /// Forwarded records stored by this server as a replica
    pub forwarded_accepted: u64,
    /// Gaps detected in incoming forwarded records
    pub gaps_detected: u64,
    /// Beacons sent by the periodic sync loop
    pub beacons_sent: u64,
    /// Records filled in by reactive sync or anti-entropy
    pub records_backfilled: u64,
    /// Record fetches that no peer could satisfy
    pub fetch_failures: u64,
}

/// Shared, lock-protected statistics
#[derive(Debug, Clone, Default)]
pub struct StatsHandle(Arc<Mutex<ReplicationStats>>);

impl StatsHandle {
    /// Apply an update
    pub fn update(&self, f: impl FnOnce(&mut ReplicationStats)) {
        f(&mut self.0.lock());
    }

    /// Copy of the current counters
    pub fn snapshot(&self) -> ReplicationStats {
        self.0.lock().clone()
    }
}
