//! Anti-entropy and reactive sync
//!
//! Replicas drift apart when a forward is lost (partition, restart). Two
//! flows repair that, both only ever writing to local storage:
//!
//! - **Reactive**: a forwarded record arrives ahead of the local log; the
//!   intervening range is fetched, preferably from the sender.
//! - **Periodic**: every sync interval one random replica of each log gets
//!   a beacon carrying our log chains. Both sides compare chains and each
//!   pulls what it lacks from the other.

use crate::name::GclName;
use crate::record::{LogChain, RecNo};
use crate::replication::config::ReplicationConfig;
use crate::replication::protocol::ReplicationMessage;
use crate::replication::service::ReplicationService;
use crate::replication::stats::StatsHandle;
use crate::replication::transport::Transport;
use crate::store::RecordStore;
use crate::{Error, Gcl, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

/// Fetches in flight per backfill pass; sends to one peer share a lockstep
/// connection and a queued fetch spends its deadline waiting its turn.
pub const MAX_CONCURRENT_FETCHES: usize = 16;

/// Inclusive run of record numbers missing locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// First missing record number
    pub first: RecNo,
    /// Last missing record number
    pub last: RecNo,
}

impl Gap {
    /// Create a gap; `first` must not exceed `last`
    pub fn new(first: RecNo, last: RecNo) -> Self {
        debug_assert!(first <= last);
        Self { first, last }
    }

    /// Number of missing records
    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    /// Gaps are never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Missing record numbers in order
    pub fn recnos(&self) -> impl Iterator<Item = RecNo> {
        self.first..=self.last
    }
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.first, self.last)
    }
}

/// Records present in `remote` but absent from `local`.
///
/// Both inputs are ordered, disjoint, maximal runs as produced by
/// [`RecordStore::chains`].
pub fn missing_ranges(local: &[LogChain], remote: &[LogChain]) -> Vec<Gap> {
    let mut gaps = Vec::new();
    let mut skip = 0;

    for chain in remote {
        while skip < local.len() && local[skip].last < chain.first {
            skip += 1;
        }

        let mut next = chain.first;
        let mut i = skip;
        while next <= chain.last {
            match local.get(i) {
                Some(have) if have.first <= chain.last => {
                    if have.first > next {
                        gaps.push(Gap::new(next, have.first - 1));
                    }
                    next = next.max(have.last.saturating_add(1));
                    i += 1;
                }
                _ => {
                    gaps.push(Gap::new(next, chain.last));
                    break;
                }
            }
        }
    }

    gaps
}

/// First `limit` record numbers covered by `gaps`
pub fn expand(gaps: &[Gap], limit: usize) -> Vec<RecNo> {
    gaps.iter().flat_map(Gap::recnos).take(limit).collect()
}

/// Record numbers in `start..start + count` not present in `store`.
/// Record number 0 is never a candidate.
pub fn check_missing_entries(store: &dyn RecordStore, start: RecNo, count: u64) -> Vec<RecNo> {
    let start = start.max(1);
    (start..start.saturating_add(count))
        .filter(|recno| !store.contains(*recno))
        .collect()
}

/// Outcome of one backfill pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Record numbers asked for
    pub requested: usize,
    /// Records fetched and committed locally
    pub applied: usize,
    /// Records found present by the time they were fetched
    pub already_present: usize,
    /// Record numbers no peer could supply, in order
    pub unavailable: Vec<RecNo>,
}

impl SyncReport {
    /// True if every requested record is now present
    pub fn is_complete(&self) -> bool {
        self.unavailable.is_empty()
    }

    fn merge(&mut self, recno: RecNo, fetched: Fetched) {
        match fetched {
            Fetched::Applied => self.applied += 1,
            Fetched::AlreadyPresent => self.already_present += 1,
            Fetched::Unavailable => self.unavailable.push(recno),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fetched {
    Applied,
    AlreadyPresent,
    Unavailable,
}

/// Finds and repairs missing records
#[derive(Clone)]
pub struct SyncEngine {
    local: GclName,
    transport: Arc<dyn Transport>,
    config: ReplicationConfig,
    stats: StatsHandle,
}

impl SyncEngine {
    /// Create an engine
    pub fn new(transport: Arc<dyn Transport>, config: ReplicationConfig, stats: StatsHandle) -> Self {
        Self {
            local: transport.local_name(),
            transport,
            config,
            stats,
        }
    }

    /// Fetch each record in `missing` from a replica that holds it and
    /// commit it locally, at most [`MAX_CONCURRENT_FETCHES`] at a time.
    /// Peers are tried `preferred` first, then in replica-set order. A
    /// record no peer supplies is reported, not fatal.
    pub async fn fetch_missing_entries(
        &self,
        gcl: &Arc<Gcl>,
        missing: &[RecNo],
        preferred: Option<GclName>,
    ) -> SyncReport {
        let mut report = SyncReport {
            requested: missing.len(),
            ..Default::default()
        };
        if missing.is_empty() {
            return report;
        }

        let peers: Arc<[GclName]> = self.fetch_order(gcl, preferred).into();
        let mut pending = missing.iter().copied();
        let mut fetches = JoinSet::new();
        loop {
            while fetches.len() < MAX_CONCURRENT_FETCHES {
                let Some(recno) = pending.next() else {
                    break;
                };
                let engine = self.clone();
                let gcl = gcl.clone();
                let peers = peers.clone();
                fetches.spawn(async move { (recno, engine.fetch_one(&gcl, recno, &peers).await) });
            }

            match fetches.join_next().await {
                Some(Ok((recno, fetched))) => report.merge(recno, fetched),
                Some(Err(e)) => tracing::error!(log = %gcl.name(), error = %e, "fetch task failed"),
                None => break,
            }
        }
        report.unavailable.sort_unstable();

        self.stats.update(|s| {
            s.records_backfilled += report.applied as u64;
            s.fetch_failures += report.unavailable.len() as u64;
        });

        if report.is_complete() {
            tracing::debug!(
                log = %gcl.name(),
                requested = report.requested,
                applied = report.applied,
                "backfill complete"
            );
        } else {
            tracing::warn!(
                log = %gcl.name(),
                requested = report.requested,
                applied = report.applied,
                unavailable = report.unavailable.len(),
                "backfill incomplete"
            );
        }
        report
    }

    fn fetch_order(&self, gcl: &Gcl, preferred: Option<GclName>) -> Vec<GclName> {
        let mut peers: Vec<GclName> = preferred.into_iter().filter(|p| *p != self.local).collect();
        for name in gcl.replica_names() {
            if !peers.contains(&name) {
                peers.push(name);
            }
        }
        peers
    }

    async fn fetch_one(&self, gcl: &Gcl, recno: RecNo, peers: &[GclName]) -> Fetched {
        let log = gcl.name();
        if gcl.store().contains(recno) {
            return Fetched::AlreadyPresent;
        }

        for peer in peers {
            let request = ReplicationMessage::FetchRecord { log, recno };
            let response =
                tokio::time::timeout(self.config.fetch_timeout(), self.transport.send(*peer, request)).await;

            match response {
                Ok(Ok(ReplicationMessage::Content { record, .. })) if record.recno == recno => {
                    return match gcl.store().insert(record) {
                        Ok(()) => {
                            tracing::debug!(log = %log, recno, peer = %peer, "record backfilled");
                            Fetched::Applied
                        }
                        // filled concurrently by another sync flow
                        Err(Error::Duplicate(_)) => Fetched::AlreadyPresent,
                        Err(e) => {
                            tracing::warn!(log = %log, recno, error = %e, "failed to store fetched record");
                            Fetched::Unavailable
                        }
                    };
                }
                Ok(Ok(ReplicationMessage::NotFound { .. })) => {
                    tracing::debug!(log = %log, recno, peer = %peer, "peer does not hold record");
                }
                Ok(Ok(other)) => {
                    tracing::warn!(log = %log, recno, peer = %peer, response = ?other.message_type(), "unexpected fetch response");
                }
                Ok(Err(e)) => {
                    tracing::debug!(log = %log, recno, peer = %peer, error = %e, "fetch failed");
                }
                Err(_) => {
                    tracing::warn!(log = %log, recno, peer = %peer, "fetch timed out");
                }
            }
        }
        Fetched::Unavailable
    }

    /// Repair the range between the local contiguous prefix and a forwarded
    /// record `incoming` that arrived ahead of it, fetching from `source`
    /// first. At most `max-sync-window` records are fetched per pass.
    pub async fn reactive_sync(&self, gcl: &Arc<Gcl>, source: GclName, incoming: RecNo) -> SyncReport {
        let start = gcl.contiguous_recno() + 1;
        if incoming <= start {
            return SyncReport::default();
        }
        let count = (incoming - start).min(self.config.max_sync_window as u64);
        let missing = check_missing_entries(gcl.store().as_ref(), start, count);
        if missing.is_empty() {
            return SyncReport::default();
        }

        tracing::info!(
            log = %gcl.name(),
            from = start,
            incoming,
            missing = missing.len(),
            source = %source,
            "gap detected, starting reactive sync"
        );
        self.fetch_missing_entries(gcl, &missing, Some(source)).await
    }

    /// Beacon one random replica of `gcl` and pull what it has that we lack
    pub async fn beacon(&self, gcl: &Arc<Gcl>) -> Result<SyncReport> {
        let peer = gcl.replicas().choose_random().map(|r| r.name);
        match peer {
            Some(peer) => self.beacon_to(gcl, peer).await,
            None => Ok(SyncReport::default()),
        }
    }

    /// Beacon exchange with a specific replica
    pub async fn beacon_to(&self, gcl: &Arc<Gcl>, peer: GclName) -> Result<SyncReport> {
        let log = gcl.name();
        let chains = gcl.store().chains();
        let beacon = ReplicationMessage::SyncBeacon {
            log,
            source: self.local,
            max_recno: gcl.high_water_mark(),
            chains: chains.clone(),
        };
        self.stats.update(|s| s.beacons_sent += 1);
        tracing::debug!(log = %log, peer = %peer, chains = chains.len(), "sending sync beacon");

        let reply = self.transport.send(peer, beacon).await?.into_result()?;
        let ReplicationMessage::SyncBeaconReply {
            chains: remote,
            max_recno,
            ..
        } = reply
        else {
            return Err(Error::protocol(format!(
                "expected SyncBeaconReply, got {:?}",
                reply.message_type()
            )));
        };

        let missing = expand(&missing_ranges(&chains, &remote), self.config.max_sync_window);
        if missing.is_empty() {
            tracing::debug!(log = %log, peer = %peer, remote_max = max_recno, "in sync with peer");
            return Ok(SyncReport::default());
        }
        Ok(self.fetch_missing_entries(gcl, &missing, Some(peer)).await)
    }

    /// Answer a beacon from `source`: reply with our chains and pull, in the
    /// background, whatever `source` holds that we lack.
    pub fn handle_beacon(&self, gcl: &Arc<Gcl>, source: GclName, remote: &[LogChain]) -> ReplicationMessage {
        let chains = gcl.store().chains();
        let missing = expand(&missing_ranges(&chains, remote), self.config.max_sync_window);

        if !missing.is_empty() {
            tracing::debug!(log = %gcl.name(), source = %source, missing = missing.len(), "beacon revealed missing records");
            let engine = self.clone();
            let gcl = gcl.clone();
            tokio::spawn(async move {
                engine.fetch_missing_entries(&gcl, &missing, Some(source)).await;
            });
        }

        ReplicationMessage::SyncBeaconReply {
            log: gcl.name(),
            max_recno: gcl.high_water_mark(),
            chains,
        }
    }
}

/// Background loop sending one beacon per open log every interval
pub struct SyncLoop {
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncLoop {
    /// Start the loop for `service`; it exits when stopped or when the
    /// service is dropped.
    pub fn spawn(service: &Arc<ReplicationService>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let service: Weak<ReplicationService> = Arc::downgrade(service);

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = interval.as_secs(), "sync loop started");

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let Some(service) = service.upgrade() else {
                            break;
                        };
                        for gcl in service.logs() {
                            if let Err(e) = service.sync().beacon(&gcl).await {
                                tracing::warn!(log = %gcl.name(), error = %e, "sync beacon failed");
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
            tracing::info!("sync loop stopped");
        });

        Self {
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop the loop and wait for the pass in progress to finish
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::store::MemoryStore;
    use crate::testing::ScriptedTransport;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn chains_of(recnos: &BTreeSet<RecNo>) -> Vec<LogChain> {
        let store = MemoryStore::new();
        for recno in recnos {
            store.insert(Record::new(*recno, vec![])).unwrap();
        }
        store.chains()
    }

    #[test]
    fn test_gap_after_high_water_mark() {
        // local has 1..=5, peer forwarded up to 8
        let local = [LogChain::new(1, 5)];
        let remote = [LogChain::new(1, 8)];
        let gaps = missing_ranges(&local, &remote);
        assert_eq!(gaps, vec![Gap::new(6, 8)]);
        assert_eq!(expand(&gaps, 100), vec![6, 7, 8]);
    }

    #[test]
    fn test_holes_on_both_sides() {
        let local = [LogChain::new(1, 2), LogChain::new(5, 5), LogChain::new(9, 12)];
        let remote = [LogChain::new(1, 6), LogChain::new(10, 14)];
        assert_eq!(
            missing_ranges(&local, &remote),
            vec![Gap::new(3, 4), Gap::new(6, 6), Gap::new(13, 14)]
        );
    }

    #[test]
    fn test_nothing_missing() {
        let local = [LogChain::new(1, 20)];
        assert!(missing_ranges(&local, &[LogChain::new(3, 7)]).is_empty());
        assert!(missing_ranges(&local, &[]).is_empty());
        assert_eq!(missing_ranges(&[], &[LogChain::new(3, 7)]), vec![Gap::new(3, 7)]);
    }

    #[test]
    fn test_expand_respects_limit() {
        let gaps = [Gap::new(3, 5), Gap::new(9, 20)];
        assert_eq!(expand(&gaps, 4), vec![3, 4, 5, 9]);
        assert_eq!(gaps[1].len(), 12);
        assert_eq!(gaps[0].to_string(), "[3, 5]");
    }

    #[test]
    fn test_check_missing_entries() {
        let store = MemoryStore::new();
        for recno in [1, 2, 4, 7] {
            store.insert(Record::new(recno, vec![])).unwrap();
        }
        assert_eq!(check_missing_entries(&store, 1, 8), vec![3, 5, 6, 8]);
        assert_eq!(check_missing_entries(&store, 0, 3), vec![3]);
        assert!(check_missing_entries(&store, 4, 0).is_empty());
    }

    #[test]
    fn test_report_merge() {
        let mut report = SyncReport {
            requested: 3,
            ..Default::default()
        };
        report.merge(4, Fetched::Applied);
        report.merge(5, Fetched::AlreadyPresent);
        assert!(report.is_complete());
        report.merge(6, Fetched::Unavailable);
        assert!(!report.is_complete());
        assert_eq!(report.unavailable, vec![6]);
    }

    #[tokio::test]
    async fn test_backfill_bounds_fetches_in_flight() {
        let me = GclName::from_human("me");
        let peer = GclName::from_human("peer");
        let (transport, mut sends) = ScriptedTransport::new(me);
        let engine = SyncEngine::new(transport, ReplicationConfig::default(), StatsHandle::default());
        let gcl = Gcl::open(GclName::from_human("log"), Arc::new(MemoryStore::new()), &[peer], &me);
        let total = 3 * MAX_CONCURRENT_FETCHES + 5;
        let missing: Vec<RecNo> = (1..=total as RecNo).collect();

        let backfill = tokio::spawn({
            let engine = engine.clone();
            let gcl = gcl.clone();
            async move { engine.fetch_missing_entries(&gcl, &missing, None).await }
        });

        let mut answered = 0;
        while answered < total {
            // everything outstanding right now
            let mut batch = vec![sends.recv().await.unwrap()];
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
            while let Ok(send) = sends.try_recv() {
                batch.push(send);
            }
            assert!(
                batch.len() <= MAX_CONCURRENT_FETCHES,
                "{} fetches in flight",
                batch.len()
            );

            for send in batch {
                let (log, recno) = match &send.message {
                    ReplicationMessage::FetchRecord { log, recno } => (*log, *recno),
                    other => panic!("unexpected {:?}", other),
                };
                send.respond(Ok(ReplicationMessage::Content {
                    log,
                    record: Record::new(recno, recno.to_le_bytes().to_vec()),
                }));
                answered += 1;
            }
        }

        let report = backfill.await.unwrap();
        assert_eq!(report.applied, total);
        assert!(report.is_complete());
        assert_eq!(gcl.contiguous_recno(), total as RecNo);
    }

    proptest! {
        #[test]
        fn prop_missing_ranges_is_set_difference(
            local in proptest::collection::btree_set(1u64..200, 0..120),
            remote in proptest::collection::btree_set(1u64..200, 0..120),
        ) {
            let gaps = missing_ranges(&chains_of(&local), &chains_of(&remote));
            let got = expand(&gaps, usize::MAX);
            let want: Vec<RecNo> = remote.difference(&local).copied().collect();
            prop_assert_eq!(got, want);

            // gaps are ordered and never touch each other inside one remote run
            for pair in gaps.windows(2) {
                prop_assert!(pair[0].last < pair[1].first);
            }
        }

        #[test]
        fn prop_check_missing_matches_store(
            present in proptest::collection::btree_set(1u64..100, 0..80),
            start in 1u64..100,
            count in 0u64..50,
        ) {
            let store = MemoryStore::new();
            for recno in &present {
                store.insert(Record::new(*recno, vec![])).unwrap();
            }
            let missing = check_missing_entries(&store, start, count);
            prop_assert_eq!(missing.len() as u64 + (start..start + count).filter(|r| present.contains(r)).count() as u64, count);
            prop_assert!(missing.iter().all(|r| !present.contains(r)));
        }
    }
}
