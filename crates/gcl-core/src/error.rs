//! Error types for GCL Core

use crate::name::GclName;
use crate::record::RecNo;
use thiserror::Error;

/// Result type alias using GCL Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the GCL replication engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from the network layer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol / codec errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Malformed 256-bit name
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Record store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Record number lies inside the written range but is absent (a hole)
    #[error("Record {0} missing")]
    RecordMissing(RecNo),

    /// Record number lies beyond the local high-water mark
    #[error("Record {0} not found")]
    RecordNotFound(RecNo),

    /// Record number already present
    #[error("Duplicate record {0}")]
    Duplicate(RecNo),

    /// Log is not open on this server
    #[error("Unknown log: {0}")]
    UnknownLog(GclName),

    /// Peer could not be reached
    #[error("Peer {peer} unreachable: {reason}")]
    Unreachable {
        /// Destination server
        peer: GclName,
        /// Transport-level reason
        reason: String,
    },

    /// Peer answered with a negative acknowledgment
    #[error("Peer rejected request (code {code}): {message}")]
    Nak {
        /// Failure code
        code: u32,
        /// Peer-supplied message
        message: String,
    },

    /// Quorum was not reached before the request deadline
    #[error("Quorum timeout: got {acked} ACKs, need {required}")]
    QuorumTimeout {
        /// Acknowledgments counted (including the local commit)
        acked: usize,
        /// Required ack quorum
        required: usize,
    },

    /// Too many replicas failed for the quorum to ever be met
    #[error("Quorum unreachable: {acked} ACKs, {failed} failures, need {required}")]
    QuorumUnreachable {
        /// Acknowledgments counted (including the local commit)
        acked: usize,
        /// Replicas that resolved without acknowledging
        failed: usize,
        /// Required ack quorum
        required: usize,
    },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an unreachable-peer error
    pub fn unreachable(peer: GclName, reason: impl Into<String>) -> Self {
        Self::Unreachable {
            peer,
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for failures of the replication quorum, as opposed to a failure
    /// of the local commit. The record is durable locally in this case.
    pub fn is_quorum_failure(&self) -> bool {
        matches!(
            self,
            Self::QuorumTimeout { .. } | Self::QuorumUnreachable { .. }
        )
    }
}
