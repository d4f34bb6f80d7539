//! Replication for GCL logs
//!
//! Every server holding a log is a peer; whichever server accepts a write
//! commits it locally and forwards it to the others:
//! - Forward-append with a configurable ack quorum (local commit counts as one)
//! - One reply per write, released at quorum, on early failure, or at the deadline
//! - Reactive sync when a forwarded record arrives ahead of the local log
//! - Periodic anti-entropy beacons comparing log chains between peers
//!
//! # Architecture
//!
//! ```text
//!  writer ──Append──► ┌──────────┐ ──ForwardAppend──► ┌───────────┐
//!                     │  server  │ ◄──────Created──── │ replica 1 │
//!  ◄──Appended─────── │ (commit) │ ──ForwardAppend──► ┌───────────┐
//!                     └──────────┘ ◄──────Created──── │ replica 2 │
//!                                                     └───────────┘
//!         SyncBeacon / FetchRecord between any two peers
//! ```
//!
//! # Wire Protocol
//!
//! All frames carry an [`protocol::Envelope`], bincode-encoded with CRC32
//! validation:
//!
//! ```text
//! [message_type:1][length:4][payload:N][crc32:4]
//! ```

pub mod ack;
pub mod config;
pub mod forward;
mod handlers;
pub mod net;
pub mod protocol;
pub mod replica_set;
pub mod router;
pub mod service;
pub mod stats;
pub mod sync;
pub mod transport;

pub use ack::{AckContext, AckStatus, AckTracker, ForwardOutcome, QuorumVerdict};
pub use config::{GapPolicy, ReplicationConfig};
pub use forward::{ForwardCoordinator, ForwardHandle, RequestId, WriteReceipt};
pub use net::{TcpTransport, serve};
pub use protocol::{Envelope, ReplicationMessage, ReplicationMessageType};
pub use replica_set::{ReplicaServer, ReplicaSet};
pub use router::{CommandHandler, CommandRouter};
pub use service::ReplicationService;
pub use stats::ReplicationStats;
pub use sync::{Gap, SyncEngine, SyncLoop, SyncReport, check_missing_entries, missing_ranges};
pub use transport::Transport;

/// Default replication port
pub const DEFAULT_REPLICATION_PORT: u16 = 8007;
