//! Acknowledgment tracking for forwarded appends
//!
//! Each forward resolves exactly once per replica. The tracker keeps one
//! entry per replica, so a repeated answer never counts twice, and the
//! quorum verdict is a pure function of the counts.

use crate::name::GclName;
use crate::record::RecNo;
use crate::replication::forward::RequestId;
use crate::replication::protocol::ReplicationMessage;
use crate::{Error, Gcl, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// How one replica resolved a forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// Replica committed the record
    Success,
    /// Replica refused, or the send failed
    Failure,
    /// Replica ended the exchange without a result
    Abandoned,
}

/// Decoded result of one forward send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Replica reports the record committed
    Created {
        /// Record number the replica committed
        recno: RecNo,
    },
    /// NAK or transport failure
    Failed {
        /// Human-readable reason
        reason: String,
    },
    /// Terminal event without success
    EndOfStream,
}

impl ForwardOutcome {
    /// Classify the transport result of a forward send
    pub fn from_response(response: Result<ReplicationMessage>) -> Self {
        match response {
            Ok(ReplicationMessage::Created { recno, .. }) => Self::Created { recno },
            Ok(ReplicationMessage::EndOfStream { .. }) => Self::EndOfStream,
            Ok(ReplicationMessage::Failure { code, message, .. })
            | Ok(ReplicationMessage::Error { code, message }) => Self::Failed {
                reason: format!("{} (code {})", message, code),
            },
            Ok(other) => Self::Failed {
                reason: format!("unexpected response {:?}", other.message_type()),
            },
            Err(e) => Self::Failed {
                reason: e.to_string(),
            },
        }
    }
}

/// Per-request record of which replicas answered and how
#[derive(Debug, Default)]
pub struct AckTracker {
    acked: HashMap<GclName, AckStatus>,
}

impl AckTracker {
    /// Record an answer; returns false for a repeat from the same replica
    pub fn record(&mut self, replica: GclName, status: AckStatus) -> bool {
        if self.acked.contains_key(&replica) {
            return false;
        }
        self.acked.insert(replica, status);
        true
    }

    /// Replicas that committed
    pub fn successes(&self) -> usize {
        self.acked
            .values()
            .filter(|s| **s == AckStatus::Success)
            .count()
    }

    /// Replicas that resolved without committing
    pub fn failures(&self) -> usize {
        self.acked.len() - self.successes()
    }

    /// Replicas that answered at all
    pub fn resolved(&self) -> usize {
        self.acked.len()
    }

    /// Acks toward quorum: remote successes plus the local commit
    pub fn ack_count(&self) -> usize {
        self.successes() + 1
    }

    /// Drop all bookkeeping
    pub fn clear(&mut self) {
        self.acked.clear();
    }
}

/// Quorum state of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumVerdict {
    /// Not decided yet
    Pending,
    /// Enough acks, local commit included
    Reached {
        /// Acks counted
        acks: usize,
    },
    /// Cannot be reached whatever the outstanding replicas answer
    Unreachable {
        /// Acks counted
        acks: usize,
        /// Replicas that resolved without acking
        failed: usize,
    },
}

/// Decide the quorum from counts. `forwarded` is the number of replicas the
/// record was sent to; the local commit is one more voter.
pub fn evaluate(successes: usize, failures: usize, forwarded: usize, required: usize) -> QuorumVerdict {
    let acks = successes + 1;
    let voters = forwarded + 1;

    if acks >= required {
        QuorumVerdict::Reached { acks }
    } else if required > voters || failures > voters - required {
        QuorumVerdict::Unreachable {
            acks,
            failed: failures,
        }
    } else {
        QuorumVerdict::Pending
    }
}

impl QuorumVerdict {
    /// Writer-facing result of a decided verdict
    pub fn into_error(self, required: usize) -> Option<Error> {
        match self {
            Self::Unreachable { acks, failed } => Some(Error::QuorumUnreachable {
                acked: acks,
                failed,
                required,
            }),
            _ => None,
        }
    }
}

/// Continuation for one outstanding forward: which request, which replica.
///
/// Created when the forward is sent and consumed by the coordinator when
/// the response arrives, whatever the outcome.
#[derive(Debug)]
pub struct AckContext {
    pub(crate) gcl: Arc<Gcl>,
    pub(crate) request: RequestId,
    pub(crate) replica: GclName,
}

impl AckContext {
    pub(crate) fn new(gcl: Arc<Gcl>, request: RequestId, replica: GclName) -> Self {
        Self {
            gcl,
            request,
            replica,
        }
    }

    /// Replica the forward went to
    pub fn replica(&self) -> GclName {
        self.replica
    }

    /// Request this forward belongs to
    pub fn request(&self) -> RequestId {
        self.request
    }
}
