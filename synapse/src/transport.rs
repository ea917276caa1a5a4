//! Delivery Transport
//!
//! Per-agent delivery boundary. The session layer fans messages out through
//! [`Transport::deliver`]; how a message reaches the agent process (channel,
//! socket, queue) is the implementation's concern. [`ChannelTransport`]
//! delivers over in-process mailboxes and is the default for agents running
//! inside the same runtime.

use crate::session::message::Message;
use crate::types::AgentId;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

/// Per-recipient delivery failure
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// No mailbox or endpoint is attached for the recipient
    #[error("no transport endpoint for agent {0}")]
    NoEndpoint(AgentId),

    /// The recipient's endpoint rejected or dropped the message
    #[error("delivery to agent {agent} failed: {reason}")]
    Failed {
        /// Intended recipient
        agent: AgentId,
        /// Transport-level failure description
        reason: String,
    },
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Message delivery boundary, one logical endpoint per agent
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a message to a recipient; an `Ok` return is the ack
    async fn deliver(&self, recipient: &AgentId, message: &Message) -> Result<()>;
}

/// In-process transport delivering over per-agent unbounded mailboxes
#[derive(Default)]
pub struct ChannelTransport {
    mailboxes: RwLock<HashMap<AgentId, mpsc::UnboundedSender<Message>>>,
}

impl ChannelTransport {
    /// Create a transport with no attached mailboxes
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a mailbox for an agent, returning its receiving end.
    /// Re-attaching replaces the previous mailbox.
    pub async fn attach(&self, agent_id: AgentId) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.write().await.insert(agent_id, tx);
        rx
    }

    /// Detach an agent's mailbox; subsequent deliveries fail with
    /// [`DeliveryError::NoEndpoint`]
    pub async fn detach(&self, agent_id: &AgentId) {
        self.mailboxes.write().await.remove(agent_id);
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn deliver(&self, recipient: &AgentId, message: &Message) -> Result<()> {
        let mailboxes = self.mailboxes.read().await;
        let tx = mailboxes
            .get(recipient)
            .ok_or_else(|| DeliveryError::NoEndpoint(recipient.clone()))?;

        tx.send(message.clone())
            .map_err(|_| DeliveryError::Failed {
                agent: recipient.clone(),
                reason: "mailbox closed".to_string(),
            })?;

        debug!(message_id = %message.id, recipient = %recipient, "message delivered");
        Ok(())
    }
}
