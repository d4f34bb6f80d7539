//! Forward-append coordinator
//!
//! Propagates one locally committed record to every replica of its log:
//! - registers a [`ForwardRequest`] in the log's in-flight table
//! - spawns one send per replica; each completion comes back through an
//!   [`AckContext`] into [`ForwardCoordinator::complete`]
//! - replies to the writer exactly once, when the quorum verdict is decided
//! - releases the request when every forward has resolved, or at the
//!   deadline, whichever comes first

use crate::gcl::GclState;
use crate::name::GclName;
use crate::record::{RecNo, Record};
use crate::replication::ack::{AckContext, AckStatus, AckTracker, ForwardOutcome, QuorumVerdict, evaluate};
use crate::replication::config::ReplicationConfig;
use crate::replication::protocol::ReplicationMessage;
use crate::replication::stats::StatsHandle;
use crate::replication::transport::Transport;
use crate::{Error, Gcl, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Identifies one in-flight forward request
pub type RequestId = Uuid;

/// Writer-facing result of a successful replicated append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Log written
    pub log: GclName,
    /// Record number assigned by the local commit
    pub recno: RecNo,
    /// Acks counted when the reply was released, local commit included
    pub acks: usize,
    /// Ack quorum in force
    pub required: usize,
}

/// Bookkeeping for one append being propagated
pub(crate) struct ForwardRequest {
    pub(crate) recno: RecNo,
    pub(crate) required: usize,
    /// Replicas the record was sent to
    pub(crate) forwarded: HashSet<GclName>,
    pub(crate) acks: AckTracker,
    /// `None` once the writer has been answered
    pub(crate) reply: Option<oneshot::Sender<Result<WriteReceipt>>>,
    /// Always set: the request outlives both the local append and the
    /// writer's reply, and only `settle` or `expire` removes it. Carried for
    /// diagnostics in the release log.
    pub(crate) persist: bool,
    pub(crate) deadline: Option<AbortHandle>,
    pub(crate) created: Instant,
}

impl ForwardRequest {
    fn reply_sent(&self) -> bool {
        self.reply.is_none()
    }

    fn all_resolved(&self) -> bool {
        self.acks.resolved() == self.forwarded.len()
    }
}

/// Handle returned to the writer path after forwarding
#[derive(Debug)]
pub struct ForwardHandle {
    /// In-flight request id
    pub request: RequestId,
    /// Replicas the record was sent to
    pub forwarded: usize,
    reply: oneshot::Receiver<Result<WriteReceipt>>,
}

impl ForwardHandle {
    /// Wait for the single reply to the writer
    pub async fn wait(self) -> Result<WriteReceipt> {
        self.reply
            .await
            .map_err(|_| Error::internal("forward request dropped without a reply"))?
    }
}

/// Drives outbound forwarding and ack collection
#[derive(Clone)]
pub struct ForwardCoordinator {
    local: GclName,
    transport: Arc<dyn Transport>,
    config: ReplicationConfig,
    stats: StatsHandle,
}

impl ForwardCoordinator {
    /// Create a coordinator
    pub fn new(transport: Arc<dyn Transport>, config: ReplicationConfig, stats: StatsHandle) -> Self {
        Self {
            local: transport.local_name(),
            transport,
            config,
            stats,
        }
    }

    /// Forward `record`, already committed locally, to every replica of
    /// `gcl` other than this server.
    ///
    /// Never fails: per-replica send failures resolve that replica and are
    /// repaired later by anti-entropy. The writer's answer arrives through
    /// the returned handle.
    pub fn forward_append(&self, gcl: &Arc<Gcl>, record: Record) -> ForwardHandle {
        let id = Uuid::new_v4();
        let required = self.config.ack_quorum.max(1) as usize;
        let recno = record.recno;
        let (reply_tx, reply_rx) = oneshot::channel();

        let targets: Vec<GclName> = {
            let mut state = gcl.lock_state();
            let targets: Vec<GclName> = state
                .replicas
                .names()
                .into_iter()
                .filter(|name| *name != self.local)
                .collect();

            state.in_flight.insert(
                id,
                ForwardRequest {
                    recno,
                    required,
                    forwarded: targets.iter().copied().collect(),
                    acks: AckTracker::default(),
                    reply: Some(reply_tx),
                    persist: true,
                    deadline: None,
                    created: Instant::now(),
                },
            );
            targets
        };

        for replica in &targets {
            let ctx = AckContext::new(gcl.clone(), id, *replica);
            let message = ReplicationMessage::ForwardAppend {
                log: gcl.name(),
                source: self.local,
                record: record.clone(),
            };
            let coordinator = self.clone();
            tokio::spawn(async move {
                let response = coordinator.transport.send(ctx.replica, message).await;
                coordinator.complete(ctx, ForwardOutcome::from_response(response));
            });
            tracing::debug!(log = %gcl.name(), recno, replica = %replica, "forwarded append");
        }
        self.stats.update(|s| s.forwards_sent += targets.len() as u64);

        // Quorum 1 is satisfied by the local commit alone; the same pass
        // releases a request that had nobody to forward to.
        let released = {
            let mut state = gcl.lock_state();
            self.settle(gcl.name(), &mut state, id)
        };

        if !released {
            let deadline = self.spawn_deadline(gcl.clone(), id);
            let mut state = gcl.lock_state();
            match state.in_flight.get_mut(&id) {
                Some(request) => request.deadline = Some(deadline),
                // every forward resolved while the deadline was being armed
                None => deadline.abort(),
            }
        }

        ForwardHandle {
            request: id,
            forwarded: targets.len(),
            reply: reply_rx,
        }
    }

    /// Process one forward completion. Consumes the continuation whatever
    /// the outcome; anomalies are logged and never disturb the counters.
    pub fn complete(&self, ctx: AckContext, outcome: ForwardOutcome) {
        let AckContext {
            gcl,
            request,
            replica,
        } = ctx;
        let log = gcl.name();
        let mut state = gcl.lock_state();

        let Some(req) = state.in_flight.get_mut(&request) else {
            // released at the deadline, or never ours
            tracing::debug!(log = %log, replica = %replica, %request, "response for released request ignored");
            self.stats.update(|s| s.ignored_acks += 1);
            return;
        };

        if !req.forwarded.contains(&replica) {
            tracing::warn!(log = %log, replica = %replica, %request, "response from a replica that was not forwarded to");
            self.stats.update(|s| s.ignored_acks += 1);
            return;
        }

        let status = match outcome {
            ForwardOutcome::Created { recno } if recno == req.recno => AckStatus::Success,
            ForwardOutcome::Created { recno } => {
                tracing::warn!(
                    log = %log,
                    replica = %replica,
                    expected = req.recno,
                    got = recno,
                    "replica acknowledged a different record"
                );
                AckStatus::Failure
            }
            ForwardOutcome::Failed { reason } => {
                tracing::warn!(log = %log, replica = %replica, recno = req.recno, %reason, "forward failed");
                AckStatus::Failure
            }
            ForwardOutcome::EndOfStream => {
                tracing::warn!(log = %log, replica = %replica, recno = req.recno, "replica ended stream without acknowledging");
                AckStatus::Abandoned
            }
        };

        if !req.acks.record(replica, status) {
            tracing::debug!(log = %log, replica = %replica, recno = req.recno, "duplicate ack ignored");
            self.stats.update(|s| s.duplicate_acks += 1);
            return;
        }

        self.stats.update(|s| match status {
            AckStatus::Success => s.acks_received += 1,
            _ => s.forward_failures += 1,
        });

        self.settle(log, &mut state, request);
    }

    /// Reply if the verdict is decided and release the request once every
    /// forward has resolved. Returns true if the request was released.
    fn settle(&self, log: GclName, state: &mut GclState, id: RequestId) -> bool {
        let Some(req) = state.in_flight.get_mut(&id) else {
            return true;
        };

        if !req.reply_sent() {
            let verdict = evaluate(
                req.acks.successes(),
                req.acks.failures(),
                req.forwarded.len(),
                req.required,
            );
            match verdict {
                QuorumVerdict::Pending => {}
                QuorumVerdict::Reached { acks } => {
                    let receipt = WriteReceipt {
                        log,
                        recno: req.recno,
                        acks,
                        required: req.required,
                    };
                    if let Some(tx) = req.reply.take() {
                        let _ = tx.send(Ok(receipt));
                    }
                    tracing::debug!(log = %log, recno = req.recno, acks, "quorum reached");
                    self.stats.update(|s| s.replies_sent += 1);
                }
                QuorumVerdict::Unreachable { .. } => {
                    if let (Some(tx), Some(err)) = (req.reply.take(), verdict.into_error(req.required)) {
                        tracing::error!(log = %log, recno = req.recno, error = %err, "write not replicated");
                        let _ = tx.send(Err(err));
                    }
                    self.stats.update(|s| s.quorum_failures += 1);
                }
            }
        }

        if req.all_resolved() {
            if let Some(mut req) = state.in_flight.remove(&id) {
                req.acks.clear();
                if let Some(deadline) = req.deadline.take() {
                    deadline.abort();
                }
                tracing::debug!(
                    log = %log,
                    recno = req.recno,
                    persist = req.persist,
                    elapsed_ms = req.created.elapsed().as_millis() as u64,
                    "forward request released"
                );
            }
            self.stats.update(|s| s.requests_released += 1);
            return true;
        }
        false
    }

    fn spawn_deadline(&self, gcl: Arc<Gcl>, id: RequestId) -> AbortHandle {
        let coordinator = self.clone();
        let timeout = self.config.ack_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            coordinator.expire(&gcl, id);
        })
        .abort_handle()
    }

    /// Deadline path: answer the writer with a timeout if nobody has, then
    /// release the request. Replicas still outstanding are left to
    /// anti-entropy.
    pub(crate) fn expire(&self, gcl: &Gcl, id: RequestId) {
        let log = gcl.name();
        let mut state = gcl.lock_state();
        let Some(mut req) = state.in_flight.remove(&id) else {
            return;
        };

        let outstanding = req.forwarded.len() - req.acks.resolved();
        if let Some(tx) = req.reply.take() {
            let err = Error::QuorumTimeout {
                acked: req.acks.ack_count(),
                required: req.required,
            };
            tracing::error!(log = %log, recno = req.recno, outstanding, error = %err, "write not replicated");
            let _ = tx.send(Err(err));
            self.stats.update(|s| s.quorum_failures += 1);
        } else {
            tracing::warn!(log = %log, recno = req.recno, outstanding, "forward deadline passed; replicas left to anti-entropy");
        }
        req.acks.clear();
        self.stats.update(|s| s.requests_released += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RecordStore};
    use crate::testing::{ScriptedSend, ScriptedTransport};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        coordinator: ForwardCoordinator,
        gcl: Arc<Gcl>,
        sends: mpsc::UnboundedReceiver<ScriptedSend>,
        stats: StatsHandle,
    }

    fn fixture(peers: &[&str], quorum: u32) -> Fixture {
        let local = GclName::from_human("primary");
        let (transport, sends) = ScriptedTransport::new(local);
        let peers: Vec<GclName> = peers.iter().map(|p| GclName::from_human(p)).collect();
        let config = ReplicationConfig::default()
            .with_peers(peers.clone())
            .with_quorum(quorum)
            .with_ack_timeout(Duration::from_secs(5));
        let stats = StatsHandle::default();
        let gcl = Gcl::open(
            GclName::from_human("log"),
            Arc::new(MemoryStore::new()),
            &peers,
            &local,
        );
        Fixture {
            coordinator: ForwardCoordinator::new(transport, config, stats.clone()),
            gcl,
            sends,
            stats,
        }
    }

    fn commit(gcl: &Gcl) -> Record {
        gcl.store().append(b"payload".to_vec()).unwrap()
    }

    fn created(send: &ScriptedSend) -> Result<ReplicationMessage> {
        match &send.message {
            ReplicationMessage::ForwardAppend { log, record, .. } => Ok(ReplicationMessage::Created {
                log: *log,
                recno: record.recno,
            }),
            other => panic!("unexpected send {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_quorum_one_replies_without_remote_ack() {
        let mut f = fixture(&["b"], 1);
        let record = commit(&f.gcl);
        let handle = f.coordinator.forward_append(&f.gcl, record);
        assert_eq!(handle.forwarded, 1);

        let receipt = handle.wait().await.unwrap();
        assert_eq!(receipt.acks, 1);
        assert_eq!(receipt.recno, 1);

        // forward still issued; its later failure changes nothing
        let send = f.sends.recv().await.unwrap();
        assert_eq!(send.to, GclName::from_human("b"));
        assert_eq!(f.gcl.in_flight(), 1);
        let persisted = f
            .gcl
            .lock_state()
            .in_flight
            .values()
            .all(|req| req.persist && req.reply_sent());
        assert!(persisted, "answered request must stay until its forward resolves");
        send.respond(Err(Error::unreachable(GclName::from_human("b"), "down")));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let stats = f.stats.snapshot();
        assert_eq!(stats.replies_sent, 1);
        assert_eq!(stats.quorum_failures, 0);
        assert_eq!(stats.requests_released, 1);
        assert_eq!(f.gcl.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_no_replicas_releases_immediately() {
        let f = fixture(&[], 1);
        let record = commit(&f.gcl);
        let handle = f.coordinator.forward_append(&f.gcl, record);
        assert_eq!(handle.forwarded, 0);
        assert_eq!(handle.wait().await.unwrap().acks, 1);
        assert_eq!(f.gcl.in_flight(), 0);
        assert_eq!(f.stats.snapshot().requests_released, 1);
    }

    #[tokio::test]
    async fn test_quorum_two_waits_for_first_remote_ack() {
        let mut f = fixture(&["b", "c"], 2);
        let record = commit(&f.gcl);
        let mut handle = f.coordinator.forward_append(&f.gcl, record);

        let first = f.sends.recv().await.unwrap();
        let second = f.sends.recv().await.unwrap();

        // nothing answered yet
        assert!(handle.reply.try_recv().is_err());

        let response = created(&first);
        first.respond(response);
        let receipt = handle.wait().await.unwrap();
        assert_eq!(receipt.acks, 2);
        assert_eq!(f.gcl.in_flight(), 1);

        let response = created(&second);
        second.respond(response);
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let stats = f.stats.snapshot();
        assert_eq!(stats.replies_sent, 1);
        assert_eq!(stats.acks_received, 2);
        assert_eq!(stats.requests_released, 1);
        assert_eq!(f.gcl.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_ack_does_not_reach_quorum() {
        let f = fixture(&["b", "c"], 3);
        let record = commit(&f.gcl);
        let handle = f.coordinator.forward_append(&f.gcl, record);
        let b = GclName::from_human("b");

        // the same replica answering twice
        for _ in 0..2 {
            let ctx = AckContext::new(f.gcl.clone(), handle.request, b);
            f.coordinator.complete(ctx, ForwardOutcome::Created { recno: 1 });
        }

        let stats = f.stats.snapshot();
        assert_eq!(stats.acks_received, 1);
        assert_eq!(stats.duplicate_acks, 1);
        assert_eq!(stats.replies_sent, 0);
        assert_eq!(f.gcl.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_uncorrelated_responses_are_ignored() {
        let f = fixture(&["b"], 2);
        let record = commit(&f.gcl);
        let handle = f.coordinator.forward_append(&f.gcl, record);

        let stranger = AckContext::new(f.gcl.clone(), handle.request, GclName::from_human("z"));
        f.coordinator.complete(stranger, ForwardOutcome::Created { recno: 1 });

        let unknown = AckContext::new(f.gcl.clone(), Uuid::new_v4(), GclName::from_human("b"));
        f.coordinator.complete(unknown, ForwardOutcome::Created { recno: 1 });

        let stats = f.stats.snapshot();
        assert_eq!(stats.ignored_acks, 2);
        assert_eq!(stats.acks_received, 0);
        assert_eq!(f.gcl.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_failures_make_quorum_unreachable() {
        let f = fixture(&["b", "c"], 3);
        let record = commit(&f.gcl);
        let handle = f.coordinator.forward_append(&f.gcl, record);

        let ctx = AckContext::new(f.gcl.clone(), handle.request, GclName::from_human("b"));
        f.coordinator.complete(
            ctx,
            ForwardOutcome::Failed {
                reason: "disk full".into(),
            },
        );

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(
            err,
            Error::QuorumUnreachable {
                acked: 1,
                failed: 1,
                required: 3
            }
        ));
        // still waiting on c before release
        assert_eq!(f.gcl.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_end_of_stream_is_not_an_ack() {
        let f = fixture(&["b", "c"], 2);
        let record = commit(&f.gcl);
        let handle = f.coordinator.forward_append(&f.gcl, record);

        let b = AckContext::new(f.gcl.clone(), handle.request, GclName::from_human("b"));
        f.coordinator.complete(b, ForwardOutcome::EndOfStream);
        assert_eq!(f.stats.snapshot().replies_sent, 0);

        let c = AckContext::new(f.gcl.clone(), handle.request, GclName::from_human("c"));
        f.coordinator.complete(c, ForwardOutcome::Created { recno: 1 });

        assert_eq!(handle.wait().await.unwrap().acks, 2);
        assert_eq!(f.gcl.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_quorum_larger_than_replica_set_fails_fast() {
        let f = fixture(&["b"], 3);
        let record = commit(&f.gcl);
        let handle = f.coordinator.forward_append(&f.gcl, record);
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, Error::QuorumUnreachable { required: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_replies_timeout_and_releases() {
        let mut f = fixture(&["b", "c"], 2);
        let record = commit(&f.gcl);
        let handle = f.coordinator.forward_append(&f.gcl, record);

        // keep the scripted sends parked so no replica ever answers
        let _b = f.sends.recv().await.unwrap();
        let _c = f.sends.recv().await.unwrap();

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(
            err,
            Error::QuorumTimeout {
                acked: 1,
                required: 2
            }
        ));
        assert!(err.is_quorum_failure());
        assert_eq!(f.gcl.in_flight(), 0);

        let stats = f.stats.snapshot();
        assert_eq!(stats.quorum_failures, 1);
        assert_eq!(stats.requests_released, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_ack_after_deadline_is_ignored() {
        let mut f = fixture(&["b", "c"], 3);
        let record = commit(&f.gcl);
        let handle = f.coordinator.forward_append(&f.gcl, record);
        let b = f.sends.recv().await.unwrap();
        let _c = f.sends.recv().await.unwrap();

        assert!(handle.wait().await.is_err());

        let response = created(&b);
        b.respond(response);
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let stats = f.stats.snapshot();
        assert_eq!(stats.ignored_acks, 1);
        assert_eq!(stats.requests_released, 1);
        assert_eq!(stats.replies_sent, 0);
    }
}
