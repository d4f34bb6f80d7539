//! Command dispatch
//!
//! A [`CommandRouter`] maps each inbound message type to its handler. It is
//! built once at service startup and shared by reference with whatever
//! delivers inbound frames (the TCP listener, the in-process test network).

use crate::Result;
use crate::name::GclName;
use crate::replication::protocol::{ReplicationMessage, ReplicationMessageType, nak};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Handles one kind of inbound command
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Process `message` received from `src` and produce the response
    async fn handle(&self, src: GclName, message: ReplicationMessage) -> Result<ReplicationMessage>;
}

/// Dispatch table from message type to handler
#[derive(Default, Clone)]
pub struct CommandRouter {
    handlers: HashMap<ReplicationMessageType, Arc<dyn CommandHandler>>,
}

impl CommandRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one
    pub fn register(&mut self, kind: ReplicationMessageType, handler: Arc<dyn CommandHandler>) {
        if self.handlers.insert(kind, handler).is_some() {
            tracing::warn!(?kind, "command handler replaced");
        }
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, kind: ReplicationMessageType, handler: Arc<dyn CommandHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    /// True if `kind` has a handler
    pub fn handles(&self, kind: ReplicationMessageType) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Dispatch one inbound message. Never fails: handler errors and
    /// unknown commands become `Error` responses.
    pub async fn dispatch(&self, src: GclName, message: ReplicationMessage) -> ReplicationMessage {
        let kind = message.message_type();
        let Some(handler) = self.handlers.get(&kind).cloned() else {
            tracing::warn!(?kind, src = %src, "no handler registered for command");
            return ReplicationMessage::Error {
                code: nak::BAD_REQUEST,
                message: format!("unsupported command {:?}", kind),
            };
        };

        match handler.handle(src, message).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(?kind, src = %src, error = %e, "command failed");
                ReplicationMessage::Error {
                    code: crate::replication::protocol::nak_code(&e),
                    message: e.to_string(),
                }
            }
        }
    }
}
