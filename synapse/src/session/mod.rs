//! Coordination Sessions
//!
//! Multi-party, message-ordered conversations among a fixed set of agents.
//! The coordinator owns session lifecycle, assigns the per-session total
//! message order through an owned sequencer, stamps enabled extension tags
//! onto every message, fans deliveries out through the transport, and
//! mirrors appends to the audit store best-effort.
//!
//! Sequence assignment is the only strictly serialized operation: the
//! sequencer and the log live behind one per-session mutex so an append
//! either fully succeeds with an assigned sequence or fails without partial
//! effect. Unrelated sessions proceed fully in parallel.

pub mod delivery;
pub mod message;

use crate::audit::AuditStore;
use crate::config::SessionConfig;
use crate::directory::AgentDirectory;
use crate::resilience::CircuitBreaker;
use crate::types::{AgentId, MessageId, SessionId};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use delivery::DeliveryManager;
use message::{Message, MessageKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session id is unknown
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Session has been closed; sends are rejected
    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    /// A session was created with no participants
    #[error("session requires at least one participant")]
    NoParticipants,

    /// Sender is not a participant of the session
    #[error("agent {agent_id} is not a participant of session {session_id}")]
    NotParticipant {
        /// Offending sender
        agent_id: AgentId,
        /// Target session
        session_id: SessionId,
    },

    /// The sequencer and the log disagreed; retried once internally before
    /// surfacing
    #[error("sequence conflict in session {session_id}: expected {expected}, log tail is {found}")]
    SequenceConflict {
        /// Target session
        session_id: SessionId,
        /// Sequence the sequencer was about to assign
        expected: u64,
        /// Sequence at the log tail
        found: u64,
    },
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Interaction mode of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Peers contribute on equal footing
    Collaborative,
    /// One sender, many listeners
    Broadcast,
    /// Convener directs subordinate agents
    Hierarchical,
}

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting messages
    Active,
    /// Frozen; sends are rejected
    Closed,
}

/// Opt-in extension capabilities of a session. Each enabled extension's tag
/// is stamped onto every message the session produces, so downstream
/// consumers can filter without a second storage system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionExtension {
    /// Natural-language coordination between agents
    NaturalLanguageCoordination,
    /// Cross-session memory curation
    MemoryCuration,
    /// Insight synthesis over the conversation
    InsightSynthesis,
}

impl SessionExtension {
    /// Stable tag stamped onto messages
    pub fn tag(&self) -> &'static str {
        match self {
            Self::NaturalLanguageCoordination => "nlc",
            Self::MemoryCuration => "memory-curation",
            Self::InsightSynthesis => "insight-synthesis",
        }
    }
}

/// Descriptor of one coordination session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationSession {
    /// Unique session id
    pub id: SessionId,

    /// Human-readable name
    pub name: String,

    /// Ordered, de-duplicated participant set; immutable once closed
    pub participant_ids: Vec<AgentId>,

    /// Interaction mode
    pub mode: SessionMode,

    /// Conversation topic
    pub topic: String,

    /// Enabled extension capabilities
    pub extensions: HashSet<SessionExtension>,

    /// Lifecycle status
    pub status: SessionStatus,

    /// When the session was created
    pub created_at: DateTime<Utc>,
}

/// Sequencer and message log, guarded together so sequence assignment and
/// append are atomic from the caller's point of view
struct SessionLog {
    next_sequence: u64,
    messages: Vec<Message>,
}

struct SessionState {
    meta: RwLock<CoordinationSession>,
    log: Mutex<SessionLog>,
    cancel: CancellationToken,
    last_activity: RwLock<DateTime<Utc>>,
}

/// Owner of all active sessions and their message order
pub struct SessionCoordinator {
    sessions: RwLock<HashMap<SessionId, Arc<SessionState>>>,
    directory: Arc<AgentDirectory>,
    delivery: Arc<DeliveryManager>,
    audit: Option<Arc<dyn AuditStore>>,
    breaker: Arc<CircuitBreaker>,
    config: SessionConfig,
    /// Subscriber notified of every successful append, best-effort
    appends: std::sync::Mutex<Option<mpsc::UnboundedSender<SessionId>>>,
}

impl SessionCoordinator {
    /// Create a coordinator without audit mirroring
    pub fn new(
        config: SessionConfig,
        directory: Arc<AgentDirectory>,
        delivery: Arc<DeliveryManager>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            directory,
            delivery,
            audit: None,
            breaker,
            config,
            appends: std::sync::Mutex::new(None),
        }
    }

    /// Create a coordinator that mirrors appended messages to the audit
    /// store
    pub fn with_audit(
        config: SessionConfig,
        directory: Arc<AgentDirectory>,
        delivery: Arc<DeliveryManager>,
        breaker: Arc<CircuitBreaker>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            directory,
            delivery,
            audit: Some(audit),
            breaker,
            config,
            appends: std::sync::Mutex::new(None),
        }
    }

    /// Subscribe to append notifications. Every successful `send` publishes
    /// its session id; the scheduler listens on this channel to drive its
    /// message-count trigger. Re-subscribing replaces the previous
    /// subscriber.
    pub fn subscribe_appends(&self) -> mpsc::UnboundedReceiver<SessionId> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.lock_appends() = Some(tx);
        rx
    }

    fn lock_appends(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<SessionId>>> {
        // Never held across an await point
        self.appends.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a session.
    ///
    /// Participants must be non-empty. Each id is checked against the
    /// directory, but a missing record only logs a warning; directory
    /// unavailability must never block session creation.
    pub async fn create(
        &self,
        name: impl Into<String>,
        participant_ids: Vec<AgentId>,
        mode: SessionMode,
        topic: impl Into<String>,
        extensions: HashSet<SessionExtension>,
    ) -> Result<SessionId> {
        if participant_ids.is_empty() {
            return Err(SessionError::NoParticipants);
        }

        // De-duplicate while keeping the convener's ordering
        let mut seen = HashSet::new();
        let participant_ids: Vec<AgentId> = participant_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();

        for id in &participant_ids {
            if !self.directory.contains(id).await {
                warn!(agent_id = %id, "participant not found in directory at session creation");
            }
        }

        let session = CoordinationSession {
            id: SessionId::new(),
            name: name.into(),
            participant_ids,
            mode,
            topic: topic.into(),
            extensions,
            status: SessionStatus::Active,
            created_at: Utc::now(),
        };
        let id = session.id.clone();

        info!(session_id = %id, participants = session.participant_ids.len(), "session created");

        self.sessions.write().await.insert(
            id.clone(),
            Arc::new(SessionState {
                meta: RwLock::new(session),
                log: Mutex::new(SessionLog {
                    next_sequence: 1,
                    messages: Vec::new(),
                }),
                cancel: CancellationToken::new(),
                last_activity: RwLock::new(Utc::now()),
            }),
        );

        Ok(id)
    }

    /// Append a message to a session and fan it out to its recipients.
    ///
    /// Sequence assignment is serialized per session; the returned message
    /// id corresponds to a fully appended message.
    pub async fn send(
        &self,
        session_id: &SessionId,
        from: AgentId,
        to: Option<AgentId>,
        kind: MessageKind,
        content: impl Into<String>,
        tags: HashSet<String>,
    ) -> Result<MessageId> {
        let state = self.state(session_id).await?;

        let (participants, extension_tags) = {
            let meta = state.meta.read().await;
            if meta.status == SessionStatus::Closed {
                return Err(SessionError::SessionClosed(session_id.clone()));
            }
            if from != AgentId::system() && !meta.participant_ids.contains(&from) {
                return Err(SessionError::NotParticipant {
                    agent_id: from,
                    session_id: session_id.clone(),
                });
            }
            let tags: Vec<&'static str> = meta.extensions.iter().map(|e| e.tag()).collect();
            (meta.participant_ids.clone(), tags)
        };

        let mut tags = tags;
        for tag in extension_tags {
            tags.insert(tag.to_string());
        }

        let message = self
            .append(&state, session_id, from.clone(), to.clone(), kind, content.into(), tags)
            .await?;

        *state.last_activity.write().await = Utc::now();
        self.mirror_message(&message);

        if let Some(tx) = self.lock_appends().as_ref() {
            let _ = tx.send(session_id.clone());
        }

        let recipients: Vec<AgentId> = match &to {
            Some(recipient) => vec![recipient.clone()],
            None => participants.into_iter().filter(|p| *p != from).collect(),
        };
        self.delivery.fan_out(message.clone(), recipients);

        Ok(message.id)
    }

    /// Append a broadcast message, delivered to all other active
    /// participants
    pub async fn broadcast(
        &self,
        session_id: &SessionId,
        from: AgentId,
        kind: MessageKind,
        content: impl Into<String>,
        tags: HashSet<String>,
    ) -> Result<MessageId> {
        self.send(session_id, from, None, kind, content, tags).await
    }

    /// Session history in ascending sequence order. `since_sequence` resumes
    /// paging after the given sequence number.
    pub async fn history(
        &self,
        session_id: &SessionId,
        since_sequence: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        let state = self.state(session_id).await?;
        let log = state.log.lock().await;
        let since = since_sequence.unwrap_or(0);
        let limit = limit
            .unwrap_or(self.config.history_page_limit)
            .min(self.config.history_page_limit);

        Ok(log
            .messages
            .iter()
            .filter(|m| m.sequence_number > since)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Close a session: freeze the participant set, cancel in-flight
    /// analysis, and reject subsequent sends. Idempotent.
    pub async fn close(&self, session_id: &SessionId) -> Result<()> {
        let state = self.state(session_id).await?;
        let mut meta = state.meta.write().await;

        if meta.status == SessionStatus::Closed {
            return Ok(());
        }

        meta.status = SessionStatus::Closed;
        state.cancel.cancel();
        info!(session_id = %session_id, "session closed");
        Ok(())
    }

    /// Close sessions with no message activity for the configured idle
    /// timeout; returns the closed session ids
    pub async fn close_idle(&self) -> Vec<SessionId> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.idle_timeout_secs as i64);
        let sessions = self.sessions.read().await;
        let mut closed = Vec::new();

        for (id, state) in sessions.iter() {
            let idle = *state.last_activity.read().await < cutoff;
            if idle {
                let mut meta = state.meta.write().await;
                if meta.status == SessionStatus::Active {
                    meta.status = SessionStatus::Closed;
                    state.cancel.cancel();
                    info!(session_id = %id, "idle session closed");
                    closed.push(id.clone());
                }
            }
        }
        closed
    }

    /// Snapshot of a session's descriptor
    pub async fn session(&self, session_id: &SessionId) -> Result<CoordinationSession> {
        let state = self.state(session_id).await?;
        Ok(state.meta.read().await.clone())
    }

    /// Ids of sessions currently accepting messages
    pub async fn active_sessions(&self) -> Vec<SessionId> {
        let sessions = self.sessions.read().await;
        let mut active = Vec::new();
        for (id, state) in sessions.iter() {
            if state.meta.read().await.status == SessionStatus::Active {
                active.push(id.clone());
            }
        }
        active
    }

    /// Cancellation token observed by analysis runs for this session
    pub async fn cancellation(&self, session_id: &SessionId) -> Result<CancellationToken> {
        let state = self.state(session_id).await?;
        Ok(state.cancel.clone())
    }

    /// Highest sequence number appended to the session so far
    pub async fn last_sequence(&self, session_id: &SessionId) -> Result<u64> {
        let state = self.state(session_id).await?;
        let log = state.log.lock().await;
        Ok(log.next_sequence - 1)
    }

    async fn state(&self, session_id: &SessionId) -> Result<Arc<SessionState>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::SessionNotFound(session_id.clone()))
    }

    /// Assign the next sequence and append under one lock. A disagreement
    /// between the sequencer and the log tail is resynced and retried once.
    async fn append(
        &self,
        state: &SessionState,
        session_id: &SessionId,
        from: AgentId,
        to: Option<AgentId>,
        kind: MessageKind,
        content: String,
        tags: HashSet<String>,
    ) -> Result<Message> {
        let mut log = state.log.lock().await;

        for attempt in 0..2 {
            let expected = log.next_sequence;
            let tail = log.messages.last().map(|m| m.sequence_number).unwrap_or(0);

            if tail + 1 != expected {
                if attempt == 0 {
                    warn!(
                        session_id = %session_id,
                        expected,
                        tail,
                        "sequencer out of sync with log tail, resyncing"
                    );
                    log.next_sequence = tail + 1;
                    continue;
                }
                return Err(SessionError::SequenceConflict {
                    session_id: session_id.clone(),
                    expected,
                    found: tail,
                });
            }

            let message = Message::new(
                session_id.clone(),
                from,
                to,
                kind,
                content,
                tags,
                expected,
            );
            log.messages.push(message.clone());
            log.next_sequence += 1;
            return Ok(message);
        }

        unreachable!("append loop always returns within two attempts")
    }

    /// Mirror an appended message to the audit store, best-effort
    fn mirror_message(&self, message: &Message) {
        let Some(audit) = self.audit.clone() else {
            return;
        };
        let breaker = Arc::clone(&self.breaker);
        let content = message.content.clone();
        let mut metadata = HashMap::new();
        metadata.insert("kind".to_string(), json!("message"));
        metadata.insert("session_id".to_string(), json!(message.session_id.to_string()));
        metadata.insert("from".to_string(), json!(message.from_agent_id.to_string()));
        metadata.insert("sequence".to_string(), json!(message.sequence_number));
        metadata.insert("message_kind".to_string(), json!(message.kind));

        tokio::spawn(async move {
            if let Err(e) = breaker.call(|| audit.append(content, metadata)).await {
                warn!(error = %e, "failed to mirror message to audit store");
            }
        });
    }
}
