//! GCL Core - replication engine for append-only logs
//!
//! This crate provides:
//! - 256-bit log and server names
//! - Records and the record store adapter the engine writes through
//! - Quorum forward-append with de-duplicated acknowledgment tracking
//! - Reactive sync and periodic anti-entropy between replicas
//! - The replication wire protocol, a command router and a TCP transport
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │          ReplicationService                  │
//! │  (open logs, command router, sync loop)     │
//! └──────┬──────────────────────┬───────────────┘
//!        │                      │
//! ┌──────┴────────────┐  ┌──────┴───────────────┐
//! │ForwardCoordinator │  │     SyncEngine        │
//! │ (acks, quorum)    │  │ (gaps, fetch, beacon)│
//! └──────┬────────────┘  └──────┬───────────────┘
//!        │                      │
//! ┌──────┴──────────────────────┴───────────────┐
//! │      Gcl (replica set, in-flight requests)   │
//! │      RecordStore          Transport          │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(clippy::all)]

pub mod error;
pub mod gcl;
pub mod name;
pub mod record;
pub mod replication;
pub mod store;
pub mod testing;

pub use error::{Error, Result};
pub use gcl::Gcl;
pub use name::GclName;
pub use record::{LogChain, RecNo, Record};
pub use store::{MemoryStore, RecordStore};
