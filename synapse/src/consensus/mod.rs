//! Consensus Engine
//!
//! Weighted semantic voting over a session's recent contributions. A round
//! collects each participant's most recent contribution or decision since
//! the last round on the topic, clusters positions by pairwise similarity,
//! tallies agreement weighted by directory trust, and resolves to agreed,
//! compromise, or unresolved. At most one round is in flight per
//! session+topic; a concurrent call observes the in-flight round's result
//! instead of starting a duplicate. Analysis failures are absorbed by the
//! scheduler: they produce no round and never surface as session failures.

pub mod semantic;

use crate::audit::AuditStore;
use crate::config::ConsensusConfig;
use crate::directory::AgentDirectory;
use crate::resilience::CircuitBreaker;
use crate::session::message::{Message, MessageKind};
use crate::session::{SessionCoordinator, SessionError};
use crate::types::{AgentId, RoundId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Consensus errors. These are analysis-pipeline errors: the scheduler logs
/// and skips them, they never propagate to the session.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// No contribution or decision messages to analyze since the last round
    #[error("no messages to analyze for session {session_id} topic '{topic}'")]
    NoMessages {
        /// Target session
        session_id: SessionId,
        /// Round topic
        topic: String,
    },

    /// The session was closed while the round was running
    #[error("consensus round cancelled for session {0}")]
    Cancelled(SessionId),

    /// The in-flight round this call was waiting on failed
    #[error("in-flight round failed: {0}")]
    InFlightFailed(String),

    /// Session lookup failed
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// One participant's derived position in a round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    /// The position text, taken from the agent's latest contribution
    pub position: String,

    /// How strongly the position aligns with the rest of the round, 0..=1
    pub confidence: f32,

    /// Directory trust weight applied in the tally
    pub weight: f32,
}

/// Outcome of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Weighted agreement met the threshold
    Agreed,
    /// Agreement was split but the positions share extractable claims
    Compromise,
    /// No agreement and no synthesizable middle ground
    Unresolved,
}

/// One weighted-vote analysis pass over a session's recent contributions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRound {
    /// Unique round id
    pub id: RoundId,

    /// Session the round analyzed
    pub session_id: SessionId,

    /// Round topic
    pub topic: String,

    /// Derived votes; keys are a subset of the session participants at
    /// round start
    pub votes: HashMap<AgentId, Vote>,

    /// Round outcome
    pub resolution: Resolution,

    /// Synthesized middle position, present only for compromise outcomes
    pub compromise_text: Option<String>,

    /// When the round completed
    pub created_at: DateTime<Utc>,
}

type RoundKey = (SessionId, String);
type RoundOutcome = std::result::Result<ConsensusRound, String>;

/// Weighted semantic consensus over session contributions
pub struct ConsensusEngine {
    sessions: Arc<SessionCoordinator>,
    directory: Arc<AgentDirectory>,
    audit: Option<Arc<dyn AuditStore>>,
    breaker: Arc<CircuitBreaker>,
    config: ConsensusConfig,
    /// In-flight rounds; a second caller for the same key awaits the
    /// existing round's outcome. The leader's slot is released by
    /// [`RoundSlot`] even when the leader future is dropped mid-round.
    inflight: std::sync::Mutex<HashMap<RoundKey, watch::Receiver<Option<RoundOutcome>>>>,
    /// Highest sequence analyzed per session+topic
    watermarks: Mutex<HashMap<RoundKey, u64>>,
}

/// Releases the leader's in-flight slot on scope exit, including when the
/// leader future is cancelled before publishing an outcome
struct RoundSlot<'a> {
    engine: &'a ConsensusEngine,
    key: RoundKey,
}

impl Drop for RoundSlot<'_> {
    fn drop(&mut self) {
        self.engine.lock_inflight().remove(&self.key);
    }
}

impl ConsensusEngine {
    /// Create an engine without audit mirroring
    pub fn new(
        config: ConsensusConfig,
        sessions: Arc<SessionCoordinator>,
        directory: Arc<AgentDirectory>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            sessions,
            directory,
            audit: None,
            breaker,
            config,
            inflight: std::sync::Mutex::new(HashMap::new()),
            watermarks: Mutex::new(HashMap::new()),
        }
    }

    /// Create an engine that persists finished rounds to the audit store
    pub fn with_audit(
        config: ConsensusConfig,
        sessions: Arc<SessionCoordinator>,
        directory: Arc<AgentDirectory>,
        breaker: Arc<CircuitBreaker>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            audit: Some(audit),
            ..Self::new(config, sessions, directory, breaker)
        }
    }

    /// Run a consensus round for a session and topic.
    ///
    /// If a round for the same session+topic is already in flight, this call
    /// waits for it and returns its outcome rather than starting a
    /// duplicate.
    pub async fn run_round(&self, session_id: &SessionId, topic: &str) -> Result<ConsensusRound> {
        let key: RoundKey = (session_id.clone(), topic.to_string());

        let tx = {
            let mut inflight = self.lock_inflight();
            if let Some(rx) = inflight.get(&key) {
                Err(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                inflight.insert(key.clone(), rx);
                Ok(tx)
            }
        };
        let tx = match tx {
            Ok(tx) => tx,
            Err(rx) => return Self::await_inflight(rx).await,
        };
        let slot = RoundSlot {
            engine: self,
            key: key.clone(),
        };

        let outcome = self.analyze(session_id, topic).await;

        // Publish for waiters, then release the in-flight slot
        let shared: RoundOutcome = outcome
            .as_ref()
            .map(Clone::clone)
            .map_err(|e| e.to_string());
        let _ = tx.send(Some(shared));
        drop(slot);

        outcome
    }

    fn lock_inflight(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<RoundKey, watch::Receiver<Option<RoundOutcome>>>> {
        // Never held across an await point
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn await_inflight(
        mut rx: watch::Receiver<Option<RoundOutcome>>,
    ) -> Result<ConsensusRound> {
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome.map_err(ConsensusError::InFlightFailed);
            }
            if rx.changed().await.is_err() {
                return Err(ConsensusError::InFlightFailed(
                    "in-flight round dropped without a result".to_string(),
                ));
            }
        }
    }

    async fn analyze(&self, session_id: &SessionId, topic: &str) -> Result<ConsensusRound> {
        let cancel = self.sessions.cancellation(session_id).await?;
        let session = self.sessions.session(session_id).await?;
        let key: RoundKey = (session_id.clone(), topic.to_string());
        let watermark = self.watermarks.lock().await.get(&key).copied().unwrap_or(0);

        let messages = self.collect_since(session_id, watermark).await?;
        if cancel.is_cancelled() {
            return Err(ConsensusError::Cancelled(session_id.clone()));
        }

        // Latest contribution or decision per participant, fabric messages
        // excluded
        let mut positions: HashMap<AgentId, &Message> = HashMap::new();
        for message in &messages {
            if message.from_agent_id == AgentId::system() {
                continue;
            }
            if !matches!(message.kind, MessageKind::Contribution | MessageKind::Decision) {
                continue;
            }
            if session.participant_ids.contains(&message.from_agent_id) {
                positions.insert(message.from_agent_id.clone(), message);
            }
        }

        if positions.is_empty() {
            return Err(ConsensusError::NoMessages {
                session_id: session_id.clone(),
                topic: topic.to_string(),
            });
        }

        let round = self
            .tally(session_id, topic, &positions, &cancel)
            .await?;

        // Advance the watermark to the newest message seen this round
        if let Some(last) = messages.last() {
            self.watermarks
                .lock()
                .await
                .insert(key, last.sequence_number);
        }

        info!(
            session_id = %session_id,
            topic,
            resolution = ?round.resolution,
            voters = round.votes.len(),
            "consensus round complete"
        );

        self.record_round(&round).await;
        Ok(round)
    }

    async fn tally(
        &self,
        session_id: &SessionId,
        topic: &str,
        positions: &HashMap<AgentId, &Message>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<ConsensusRound> {
        let agents: Vec<&AgentId> = positions.keys().collect();

        // Pairwise similarity and per-agent alignment with the rest
        let mut alignment: HashMap<&AgentId, f32> = HashMap::new();
        for a in &agents {
            let mut total = 0.0;
            for b in &agents {
                if a != b {
                    total += semantic::similarity(
                        &positions[*a].content,
                        &positions[*b].content,
                    );
                }
            }
            let avg = if agents.len() > 1 {
                total / (agents.len() - 1) as f32
            } else {
                1.0
            };
            alignment.insert(*a, avg);
        }

        if cancel.is_cancelled() {
            return Err(ConsensusError::Cancelled(session_id.clone()));
        }

        // The best-aligned agent anchors the majority cluster
        let anchor = agents
            .iter()
            .max_by(|a, b| {
                alignment[**a]
                    .partial_cmp(&alignment[**b])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied()
            .ok_or_else(|| ConsensusError::NoMessages {
                session_id: session_id.clone(),
                topic: topic.to_string(),
            })?;

        let mut votes = HashMap::new();
        let mut agreeing_weight = 0.0;
        let mut total_weight = 0.0;
        let mut majority_claims: Vec<String> = Vec::new();
        let mut dissenting_claims: Vec<String> = Vec::new();

        for agent in &agents {
            let content = &positions[*agent].content;
            let to_anchor = if *agent == anchor {
                1.0
            } else {
                semantic::similarity(content, &positions[anchor].content)
            };
            let weight = self.directory.trust_weight(agent).await;
            let agrees = to_anchor >= self.config.similarity_threshold;

            total_weight += weight;
            if agrees {
                agreeing_weight += weight;
                majority_claims.extend(semantic::extract_claims(content));
            } else {
                dissenting_claims.extend(semantic::extract_claims(content));
            }

            votes.insert(
                (*agent).clone(),
                Vote {
                    position: content.clone(),
                    confidence: alignment[*agent].clamp(0.0, 1.0),
                    weight,
                },
            );
        }

        let agreement = if total_weight > 0.0 {
            agreeing_weight / total_weight
        } else {
            0.0
        };
        debug!(session_id = %session_id, topic, agreement, "weighted tally");

        let (resolution, compromise_text) = if agreement >= self.config.agreement_threshold {
            (Resolution::Agreed, None)
        } else {
            let overlap = semantic::overlapping_claims(
                &majority_claims,
                &dissenting_claims,
                self.config.similarity_threshold,
            );
            if overlap.is_empty() {
                (Resolution::Unresolved, None)
            } else {
                (Resolution::Compromise, Some(format!("Shared ground: {}", overlap.join("; "))))
            }
        };

        Ok(ConsensusRound {
            id: RoundId::new(),
            session_id: session_id.clone(),
            topic: topic.to_string(),
            votes,
            resolution,
            compromise_text,
            created_at: Utc::now(),
        })
    }

    /// Page through the session history from the watermark to the tail
    async fn collect_since(&self, session_id: &SessionId, since: u64) -> Result<Vec<Message>> {
        let mut all = Vec::new();
        let mut cursor = since;
        loop {
            let page = self.sessions.history(session_id, Some(cursor), None).await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = last.sequence_number;
            all.extend(page);
        }
        Ok(all)
    }

    /// Write the round back into the session and mirror it to the audit
    /// store, best-effort
    async fn record_round(&self, round: &ConsensusRound) {
        let summary = match round.resolution {
            Resolution::Agreed => format!("consensus reached on '{}'", round.topic),
            Resolution::Compromise => format!(
                "compromise on '{}': {}",
                round.topic,
                round.compromise_text.as_deref().unwrap_or_default()
            ),
            Resolution::Unresolved => format!("no consensus on '{}'", round.topic),
        };

        if let Err(e) = self
            .sessions
            .send(
                &round.session_id,
                AgentId::system(),
                None,
                MessageKind::Decision,
                summary.clone(),
                Default::default(),
            )
            .await
        {
            warn!(error = %e, "failed to write round outcome back into session");
        }

        let Some(audit) = self.audit.clone() else {
            return;
        };
        let breaker = Arc::clone(&self.breaker);
        let mut metadata = HashMap::new();
        metadata.insert("kind".to_string(), json!("consensus_round"));
        metadata.insert("session_id".to_string(), json!(round.session_id.to_string()));
        metadata.insert("topic".to_string(), json!(round.topic));
        metadata.insert("resolution".to_string(), json!(round.resolution));

        tokio::spawn(async move {
            if let Err(e) = breaker.call(|| audit.append(summary, metadata)).await {
                warn!(error = %e, "failed to mirror consensus round to audit store");
            }
        });
    }
}
