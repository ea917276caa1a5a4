//! Insight Synthesis
//!
//! Scans a session's message log since the last checkpoint for emergent
//! insights: breakthroughs (a new claim picked up by several distinct
//! agents), novel connections (two previously unlinked topics meeting in
//! one message), and syntheses (one message folding together positions
//! from several agents). Every candidate passes through the external
//! quality gate; only passing candidates are persisted and written back
//! into the session. At most one run is in flight per session; a
//! concurrent trigger is a no-op returning an empty batch.

use crate::audit::AuditStore;
use crate::config::SynthesisConfig;
use crate::consensus::semantic;
use crate::quality::QualityGate;
use crate::resilience::CircuitBreaker;
use crate::session::message::{Message, MessageKind};
use crate::session::{SessionCoordinator, SessionError};
use crate::types::{AgentId, InsightId, MessageId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Synthesis errors. Analysis-pipeline errors: the scheduler logs and
/// skips them, they never propagate to the session.
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// The session was closed while the run was in progress
    #[error("synthesis cancelled for session {0}")]
    Cancelled(SessionId),

    /// Session lookup failed
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Result type for synthesis operations
pub type Result<T> = std::result::Result<T, SynthesisError>;

/// What kind of insight a candidate represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InsightCategory {
    /// A new claim echoed by multiple distinct agents
    Breakthrough,
    /// Two previously unlinked topics co-occurring in one message
    NovelConnection,
    /// One message folding together positions from several agents
    Synthesis,
}

/// An insight that survived the quality gate. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergentInsight {
    /// Insight identifier
    pub id: InsightId,
    /// Session the insight emerged from
    pub session_id: SessionId,
    /// Messages the insight was derived from, never empty
    pub source_message_ids: Vec<MessageId>,
    /// Detected category
    pub category: InsightCategory,
    /// Detection confidence in [0, 1]
    pub confidence_score: f32,
    /// Score assigned by the external quality gate, in [0, 1]
    pub quality_score: f32,
    /// Human-readable statement of the insight
    pub summary: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// A detected candidate, prior to quality gating
struct Candidate {
    category: InsightCategory,
    summary: String,
    confidence: f32,
    source_message_ids: Vec<MessageId>,
}

// ============================================================================
// Engine
// ============================================================================

/// Detects and persists emergent insights from session message logs
pub struct InsightSynthesisEngine {
    sessions: Arc<SessionCoordinator>,
    quality: Arc<dyn QualityGate>,
    audit: Option<Arc<dyn AuditStore>>,
    breaker: Arc<CircuitBreaker>,
    config: SynthesisConfig,
    checkpoints: Mutex<HashMap<SessionId, u64>>,
    running: Mutex<HashSet<SessionId>>,
}

impl InsightSynthesisEngine {
    /// Create an engine without audit mirroring
    pub fn new(
        config: SynthesisConfig,
        sessions: Arc<SessionCoordinator>,
        quality: Arc<dyn QualityGate>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            sessions,
            quality,
            audit: None,
            breaker,
            config,
            checkpoints: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Create an engine that persists surviving insights to the audit store
    pub fn with_audit(
        config: SynthesisConfig,
        sessions: Arc<SessionCoordinator>,
        quality: Arc<dyn QualityGate>,
        breaker: Arc<CircuitBreaker>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            audit: Some(audit),
            ..Self::new(config, sessions, quality, breaker)
        }
    }

    /// Synthesize insights from the session's messages since the last
    /// checkpoint.
    ///
    /// Re-running with no new messages returns an empty batch and emits
    /// nothing. A call while another run is in flight for the same session
    /// is a no-op returning an empty batch.
    pub async fn synthesize(&self, session_id: &SessionId) -> Result<Vec<EmergentInsight>> {
        if !self.running.lock().await.insert(session_id.clone()) {
            debug!(session_id = %session_id, "synthesis already in flight, skipping");
            return Ok(Vec::new());
        }

        let result = self.run(session_id).await;
        self.running.lock().await.remove(session_id);
        result
    }

    async fn run(&self, session_id: &SessionId) -> Result<Vec<EmergentInsight>> {
        let session = self.sessions.session(session_id).await?;
        let cancel = self.sessions.cancellation(session_id).await?;

        let checkpoint = self
            .checkpoints
            .lock()
            .await
            .get(session_id)
            .copied()
            .unwrap_or(0);

        let history = self.collect_all(session_id).await?;
        if cancel.is_cancelled() {
            return Err(SynthesisError::Cancelled(session_id.clone()));
        }

        let (prior, fresh): (Vec<&Message>, Vec<&Message>) = history
            .iter()
            .partition(|m| m.sequence_number <= checkpoint);
        if fresh.is_empty() {
            debug!(session_id = %session_id, "no new messages since checkpoint");
            return Ok(Vec::new());
        }
        let last_seen = fresh.last().map(|m| m.sequence_number).unwrap_or(checkpoint);

        let mut candidates = Vec::new();
        candidates.extend(self.breakthroughs(&prior, &fresh));
        candidates.extend(self.novel_connections(&prior, &fresh));
        candidates.extend(self.syntheses(&history, &fresh));

        debug!(
            session_id = %session_id,
            fresh = fresh.len(),
            candidates = candidates.len(),
            "synthesis scan complete"
        );

        // Rejected candidates are not retried: the checkpoint advances
        // whether or not anything survives the gate.
        self.checkpoints
            .lock()
            .await
            .insert(session_id.clone(), last_seen);

        let mut insights = Vec::new();
        for candidate in candidates {
            if cancel.is_cancelled() {
                return Err(SynthesisError::Cancelled(session_id.clone()));
            }
            if let Some(insight) = self.gate(session_id, &session.topic, candidate).await {
                insights.push(insight);
            }
        }

        if !insights.is_empty() {
            info!(
                session_id = %session_id,
                insights = insights.len(),
                "insights persisted"
            );
        }
        for insight in &insights {
            self.record_insight(insight).await;
        }

        Ok(insights)
    }

    // ------------------------------------------------------------------
    // Candidate detection
    // ------------------------------------------------------------------

    /// New claims echoed by enough distinct other agents
    fn breakthroughs(&self, prior: &[&Message], fresh: &[&Message]) -> Vec<Candidate> {
        let prior_claims: Vec<String> = prior
            .iter()
            .filter(|m| m.from_agent_id != AgentId::system())
            .flat_map(|m| semantic::extract_claims(&m.content))
            .collect();

        let mut seen_claims = HashSet::new();
        let mut candidates = Vec::new();

        for message in fresh {
            if message.from_agent_id == AgentId::system() {
                continue;
            }
            for claim in semantic::extract_claims(&message.content) {
                if !seen_claims.insert(claim_key(&claim)) {
                    continue;
                }
                if semantic::is_echoed(&claim, &prior_claims, self.config.echo_similarity) {
                    continue;
                }

                // Strongest echo per distinct later agent
                let mut echoes: HashMap<&AgentId, (f32, &MessageId)> = HashMap::new();
                for later in fresh {
                    if later.sequence_number <= message.sequence_number
                        || later.from_agent_id == message.from_agent_id
                        || later.from_agent_id == AgentId::system()
                    {
                        continue;
                    }
                    for echo in semantic::extract_claims(&later.content) {
                        let score = semantic::similarity(&claim, &echo);
                        if score < self.config.echo_similarity {
                            continue;
                        }
                        let entry = echoes
                            .entry(&later.from_agent_id)
                            .or_insert((score, &later.id));
                        if score > entry.0 {
                            *entry = (score, &later.id);
                        }
                    }
                }
                if echoes.len() < self.config.min_echoing_agents {
                    continue;
                }

                let mean: f32 =
                    echoes.values().map(|(s, _)| s).sum::<f32>() / echoes.len() as f32;
                let mut sources = vec![message.id.clone()];
                let mut echo_ids: Vec<MessageId> =
                    echoes.values().map(|(_, id)| (*id).clone()).collect();
                echo_ids.sort();
                sources.extend(echo_ids);

                candidates.push(Candidate {
                    category: InsightCategory::Breakthrough,
                    summary: claim.clone(),
                    confidence: mean.clamp(0.0, 1.0),
                    source_message_ids: sources,
                });
            }
        }
        candidates
    }

    /// First co-occurrence of two topic terms previously seen only apart
    fn novel_connections(&self, prior: &[&Message], fresh: &[&Message]) -> Vec<Candidate> {
        let mut seen_terms: HashSet<String> = HashSet::new();
        let mut linked: HashSet<(String, String)> = HashSet::new();

        for message in prior {
            let terms = semantic::topic_terms(&message.content);
            link_pairs(&terms, &mut linked);
            seen_terms.extend(terms);
        }

        let mut candidates = Vec::new();
        for message in fresh {
            let terms = semantic::topic_terms(&message.content);
            if message.from_agent_id != AgentId::system() {
                let mut novel = Vec::new();
                let mut sorted: Vec<&String> = terms.iter().collect();
                sorted.sort();
                for (i, a) in sorted.iter().enumerate() {
                    for b in &sorted[i + 1..] {
                        let pair = ((*a).clone(), (*b).clone());
                        if seen_terms.contains(*a)
                            && seen_terms.contains(*b)
                            && !linked.contains(&pair)
                        {
                            novel.push(pair);
                        }
                    }
                }
                if let Some((a, b)) = novel.first() {
                    candidates.push(Candidate {
                        category: InsightCategory::NovelConnection,
                        summary: format!("connects '{a}' and '{b}': {}", message.content),
                        confidence: (0.5 + 0.1 * novel.len() as f32).min(0.9),
                        source_message_ids: vec![message.id.clone()],
                    });
                }
            }
            link_pairs(&terms, &mut linked);
            seen_terms.extend(terms);
        }
        candidates
    }

    /// A fresh message whose claims echo positions of several other agents
    fn syntheses(&self, history: &[Message], fresh: &[&Message]) -> Vec<Candidate> {
        let mut candidates = Vec::new();

        for message in fresh {
            if message.from_agent_id == AgentId::system() {
                continue;
            }
            let claims = semantic::extract_claims(&message.content);
            if claims.len() < 2 {
                continue;
            }

            // Earlier messages whose claims this one picks up, by agent
            let mut folded: HashMap<&AgentId, (f32, &MessageId)> = HashMap::new();
            for earlier in history {
                if earlier.sequence_number >= message.sequence_number
                    || earlier.from_agent_id == message.from_agent_id
                    || earlier.from_agent_id == AgentId::system()
                {
                    continue;
                }
                for their_claim in semantic::extract_claims(&earlier.content) {
                    for our_claim in &claims {
                        let score = semantic::similarity(our_claim, &their_claim);
                        if score < self.config.echo_similarity {
                            continue;
                        }
                        let entry = folded
                            .entry(&earlier.from_agent_id)
                            .or_insert((score, &earlier.id));
                        if score > entry.0 {
                            *entry = (score, &earlier.id);
                        }
                    }
                }
            }
            if folded.len() < self.config.min_echoing_agents {
                continue;
            }

            let mean: f32 = folded.values().map(|(s, _)| s).sum::<f32>() / folded.len() as f32;
            let mut sources = vec![message.id.clone()];
            let mut folded_ids: Vec<MessageId> =
                folded.values().map(|(_, id)| (*id).clone()).collect();
            folded_ids.sort();
            sources.extend(folded_ids);

            candidates.push(Candidate {
                category: InsightCategory::Synthesis,
                summary: message.content.clone(),
                confidence: mean.clamp(0.0, 1.0),
                source_message_ids: sources,
            });
        }
        candidates
    }

    // ------------------------------------------------------------------
    // Gating and persistence
    // ------------------------------------------------------------------

    /// Submit a candidate to the quality gate. Returns the built insight
    /// when it passes, `None` when it is rejected or the gate is
    /// unreachable.
    async fn gate(
        &self,
        session_id: &SessionId,
        topic: &str,
        candidate: Candidate,
    ) -> Option<EmergentInsight> {
        let verdict = match self
            .breaker
            .call(|| self.quality.validate(&candidate.summary, topic))
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "quality gate unreachable, candidate discarded");
                return None;
            }
        };

        if !verdict.passed || verdict.score < self.config.quality_threshold {
            debug!(
                session_id = %session_id,
                score = verdict.score,
                passed = verdict.passed,
                "candidate rejected by quality gate"
            );
            return None;
        }

        Some(EmergentInsight {
            id: InsightId::new(),
            session_id: session_id.clone(),
            source_message_ids: candidate.source_message_ids,
            category: candidate.category,
            confidence_score: candidate.confidence,
            quality_score: verdict.score,
            summary: candidate.summary,
            created_at: Utc::now(),
        })
    }

    /// Write the insight back into the session and mirror it to the audit
    /// store, best-effort
    async fn record_insight(&self, insight: &EmergentInsight) {
        if let Err(e) = self
            .sessions
            .send(
                &insight.session_id,
                AgentId::system(),
                None,
                MessageKind::Insight,
                insight.summary.clone(),
                Default::default(),
            )
            .await
        {
            warn!(error = %e, "failed to write insight back into session");
        }

        let Some(audit) = self.audit.clone() else {
            return;
        };
        let breaker = Arc::clone(&self.breaker);
        let mut metadata = HashMap::new();
        metadata.insert("kind".to_string(), json!("emergent_insight"));
        metadata.insert(
            "session_id".to_string(),
            json!(insight.session_id.to_string()),
        );
        metadata.insert("category".to_string(), json!(insight.category));
        metadata.insert("confidence".to_string(), json!(insight.confidence_score));
        metadata.insert("quality".to_string(), json!(insight.quality_score));
        let content = insight.summary.clone();

        tokio::spawn(async move {
            if let Err(e) = breaker.call(|| audit.append(content.clone(), metadata.clone())).await {
                warn!(error = %e, "insight not mirrored to audit store");
            }
        });
    }

    async fn collect_all(&self, session_id: &SessionId) -> Result<Vec<Message>> {
        let mut all = Vec::new();
        let mut cursor = 0;
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
}

/// Order-independent identity of a claim's content tokens
fn claim_key(claim: &str) -> String {
    let mut tokens: Vec<String> = semantic::tokenize(claim).into_iter().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Record every pair of terms co-occurring in one message as linked
fn link_pairs(terms: &HashSet<String>, linked: &mut HashSet<(String, String)>) {
    let mut sorted: Vec<&String> = terms.iter().collect();
    sorted.sort();
    for (i, a) in sorted.iter().enumerate() {
        for b in &sorted[i + 1..] {
            linked.insert(((*a).clone(), (*b).clone()));
        }
    }
}
