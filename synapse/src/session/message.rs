//! Session Message Model
//!
//! Typed, ordered messages exchanged inside a coordination session. A message
//! is immutable once appended; its `sequence_number` is assigned by the
//! session's sequencer and forms a gapless ascending run starting at 1.

use crate::types::{AgentId, MessageId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Message type within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Status update
    Update,
    /// Question to one or all participants
    Question,
    /// Substantive contribution to the session topic
    Contribution,
    /// Decision, including consensus round outcomes
    Decision,
    /// Action request or report
    Action,
    /// Synthesized insight written back by the analysis pipeline
    Insight,
}

/// One ordered message in a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id
    pub id: MessageId,

    /// Owning session
    pub session_id: SessionId,

    /// Sender
    pub from_agent_id: AgentId,

    /// Recipient; `None` means broadcast to all other participants
    pub to_agent_id: Option<AgentId>,

    /// Message type
    pub kind: MessageKind,

    /// Free-text content
    pub content: String,

    /// Tags, including the enabled extension tags of the session
    pub tags: HashSet<String>,

    /// Position in the session's total order, starting at 1
    pub sequence_number: u64,

    /// When the message was appended
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a message with a freshly assigned id and timestamp
    pub fn new(
        session_id: SessionId,
        from_agent_id: AgentId,
        to_agent_id: Option<AgentId>,
        kind: MessageKind,
        content: String,
        tags: HashSet<String>,
        sequence_number: u64,
    ) -> Self {
        Self {
            id: MessageId::new(),
            session_id,
            from_agent_id,
            to_agent_id,
            kind,
            content,
            tags,
            sequence_number,
            created_at: Utc::now(),
        }
    }

    /// Whether this message is a broadcast
    pub fn is_broadcast(&self) -> bool {
        self.to_agent_id.is_none()
    }
}
