//! Inbound command handlers

use crate::name::GclName;
use crate::replication::protocol::{ReplicationMessage, ReplicationMessageType};
use crate::replication::router::{CommandHandler, CommandRouter};
use crate::replication::service::ReplicationService;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Router with every command this server answers
pub fn routes(service: &Arc<ReplicationService>) -> CommandRouter {
    CommandRouter::new()
        .with(ReplicationMessageType::Ping, Arc::new(PingHandler))
        .with(
            ReplicationMessageType::Append,
            Arc::new(AppendHandler {
                service: service.clone(),
            }),
        )
        .with(
            ReplicationMessageType::ForwardAppend,
            Arc::new(ForwardAppendHandler {
                service: service.clone(),
            }),
        )
        .with(
            ReplicationMessageType::FetchRecord,
            Arc::new(FetchRecordHandler {
                service: service.clone(),
            }),
        )
        .with(
            ReplicationMessageType::SyncBeacon,
            Arc::new(SyncBeaconHandler {
                service: service.clone(),
            }),
        )
}

fn unexpected(message: &ReplicationMessage) -> Error {
    Error::protocol(format!(
        "handler received {:?}",
        message.message_type()
    ))
}

struct PingHandler;

#[async_trait]
impl CommandHandler for PingHandler {
    async fn handle(&self, _src: GclName, message: ReplicationMessage) -> Result<ReplicationMessage> {
        match message {
            ReplicationMessage::Ping { timestamp } => Ok(ReplicationMessage::Pong { timestamp }),
            other => Err(unexpected(&other)),
        }
    }
}

/// Writer append: commit, forward, answer once the quorum verdict is in
struct AppendHandler {
    service: Arc<ReplicationService>,
}

#[async_trait]
impl CommandHandler for AppendHandler {
    async fn handle(&self, src: GclName, message: ReplicationMessage) -> Result<ReplicationMessage> {
        let ReplicationMessage::Append { log, data } = message else {
            return Err(unexpected(&message));
        };

        let gcl = self.service.log(&log)?;
        let record = self.service.commit(&gcl, data)?;
        let recno = record.recno;

        match self.service.forward_append(&gcl, record).wait().await {
            Ok(receipt) => Ok(ReplicationMessage::Appended {
                log,
                recno,
                acks: receipt.acks as u32,
            }),
            Err(e) => {
                tracing::warn!(log = %log, recno, writer = %src, error = %e, "append not confirmed to writer");
                Ok(ReplicationMessage::failure(log, recno, &e))
            }
        }
    }
}

/// Replica side of forward-append
struct ForwardAppendHandler {
    service: Arc<ReplicationService>,
}

#[async_trait]
impl CommandHandler for ForwardAppendHandler {
    async fn handle(&self, _src: GclName, message: ReplicationMessage) -> Result<ReplicationMessage> {
        let ReplicationMessage::ForwardAppend { log, source, record } = message else {
            return Err(unexpected(&message));
        };
        let recno = record.recno;

        match self.service.accept_forwarded(log, source, record).await {
            Ok(recno) => Ok(ReplicationMessage::Created { log, recno }),
            // log no longer open here; nothing to commit into
            Err(Error::UnknownLog(_)) => Ok(ReplicationMessage::EndOfStream { log }),
            Err(e) => {
                tracing::warn!(log = %log, recno, source = %source, error = %e, "rejecting forwarded record");
                Ok(ReplicationMessage::failure(log, recno, &e))
            }
        }
    }
}

struct FetchRecordHandler {
    service: Arc<ReplicationService>,
}

#[async_trait]
impl CommandHandler for FetchRecordHandler {
    async fn handle(&self, _src: GclName, message: ReplicationMessage) -> Result<ReplicationMessage> {
        let ReplicationMessage::FetchRecord { log, recno } = message else {
            return Err(unexpected(&message));
        };

        match self.service.read(&log, recno) {
            Ok(record) => Ok(ReplicationMessage::Content { log, record }),
            Err(Error::RecordMissing(_) | Error::RecordNotFound(_) | Error::UnknownLog(_)) => {
                Ok(ReplicationMessage::NotFound { log, recno })
            }
            Err(e) => Err(e),
        }
    }
}

struct SyncBeaconHandler {
    service: Arc<ReplicationService>,
}

#[async_trait]
impl CommandHandler for SyncBeaconHandler {
    async fn handle(&self, _src: GclName, message: ReplicationMessage) -> Result<ReplicationMessage> {
        let ReplicationMessage::SyncBeacon {
            log,
            source,
            chains,
            max_recno,
        } = message
        else {
            return Err(unexpected(&message));
        };

        let gcl = self.service.log(&log)?;
        tracing::debug!(log = %log, source = %source, remote_max = max_recno, "sync beacon received");
        Ok(self.service.sync().handle_beacon(&gcl, source, &chains))
    }
}
