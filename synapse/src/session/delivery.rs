//! Delivery Fan-Out
//!
//! Fans appended messages out to recipients through the [`Transport`]
//! boundary. Delivery runs off the sender's path: failures are retried with
//! exponential backoff up to the configured attempt count, then the message
//! is parked as pending for that recipient. A delivery failure never fails
//! the sender's append.

use crate::config::DeliveryConfig;
use crate::session::message::Message;
use crate::transport::Transport;
use crate::types::AgentId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Fan-out engine with per-recipient retry and pending parking
pub struct DeliveryManager {
    transport: Arc<dyn Transport>,
    config: DeliveryConfig,
    /// Messages that exhausted their delivery attempts, per recipient
    pending: RwLock<HashMap<AgentId, Vec<Message>>>,
}

impl DeliveryManager {
    /// Create a manager over the given transport
    pub fn new(transport: Arc<dyn Transport>, config: DeliveryConfig) -> Self {
        Self {
            transport,
            config,
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Fan a message out to the given recipients without blocking the
    /// caller. Each recipient is retried independently.
    pub fn fan_out(self: &Arc<Self>, message: Message, recipients: Vec<AgentId>) {
        for recipient in recipients {
            let manager = Arc::clone(self);
            let message = message.clone();
            tokio::spawn(async move {
                manager.deliver_with_retry(recipient, message).await;
            });
        }
    }

    async fn deliver_with_retry(&self, recipient: AgentId, message: Message) {
        let mut backoff = Duration::from_millis(self.config.initial_backoff_ms);
        let max_backoff = Duration::from_millis(self.config.max_backoff_ms);

        for attempt in 1..=self.config.max_attempts {
            match self.transport.deliver(&recipient, &message).await {
                Ok(()) => return,
                Err(e) => {
                    debug!(
                        recipient = %recipient,
                        message_id = %message.id,
                        attempt,
                        error = %e,
                        "delivery attempt failed"
                    );
                }
            }

            if attempt < self.config.max_attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }

        warn!(
            recipient = %recipient,
            message_id = %message.id,
            "delivery exhausted retries, parking as pending"
        );
        self.pending
            .write()
            .await
            .entry(recipient)
            .or_default()
            .push(message);
    }

    /// Messages parked as pending for a recipient, oldest first
    pub async fn pending_for(&self, recipient: &AgentId) -> Vec<Message> {
        self.pending
            .read()
            .await
            .get(recipient)
            .cloned()
            .unwrap_or_default()
    }

    /// Drain pending messages for a recipient, e.g. when it reconnects
    pub async fn take_pending(&self, recipient: &AgentId) -> Vec<Message> {
        self.pending
            .write()
            .await
            .remove(recipient)
            .unwrap_or_default()
    }

    /// Total number of parked messages across all recipients
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::message::MessageKind;
    use crate::transport::ChannelTransport;
    use crate::types::SessionId;

    fn message() -> Message {
        Message::new(
            SessionId::from_string("s1"),
            AgentId::from_string("a"),
            None,
            MessageKind::Update,
            "ping".to_string(),
            Default::default(),
            1,
        )
    }

    fn fast_config() -> DeliveryConfig {
        DeliveryConfig {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[tokio::test]
    async fn test_fan_out_delivers_to_attached_agents() {
        let transport = Arc::new(ChannelTransport::new());
        let b = AgentId::from_string("b");
        let mut rx = transport.attach(b.clone()).await;

        let manager = Arc::new(DeliveryManager::new(transport, fast_config()));
        manager.fan_out(message(), vec![b]);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.content, "ping");
    }

    #[tokio::test]
    async fn test_exhausted_delivery_parks_pending() {
        let transport = Arc::new(ChannelTransport::new());
        let manager = Arc::new(DeliveryManager::new(transport, fast_config()));

        let ghost = AgentId::from_string("ghost");
        manager.deliver_with_retry(ghost.clone(), message()).await;

        assert_eq!(manager.pending_for(&ghost).await.len(), 1);
        assert_eq!(manager.pending_count().await, 1);

        let drained = manager.take_pending(&ghost).await;
        assert_eq!(drained.len(), 1);
        assert_eq!(manager.pending_count().await, 0);
    }
}
