//! Analysis Scheduler
//!
//! Background triggering for the consensus and synthesis engines. Every
//! session gets one consensus round and one synthesis run per pass; passes
//! happen on a fixed cadence and, for an individual session, as soon as
//! enough new messages have accumulated. The scheduler subscribes to the
//! coordinator's append notifications for the latter, and spawns the
//! resulting analysis so the notification path never waits on an engine.
//! The engines own their at-most-one in-flight guards, so a pass that
//! overlaps a running analysis is a no-op for that session, never a queue.
//! The same ticker drives idle-session closing and directory garbage
//! collection.

use crate::config::SchedulerConfig;
use crate::consensus::ConsensusEngine;
use crate::directory::AgentDirectory;
use crate::session::SessionCoordinator;
use crate::synthesis::InsightSynthesisEngine;
use crate::types::SessionId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives periodic analysis passes over all active sessions
pub struct AnalysisScheduler {
    sessions: Arc<SessionCoordinator>,
    directory: Arc<AgentDirectory>,
    consensus: Arc<ConsensusEngine>,
    synthesis: Arc<InsightSynthesisEngine>,
    config: SchedulerConfig,
    // Last sequence number analyzed per session, for the message-count
    // trigger
    analyzed: Mutex<HashMap<SessionId, u64>>,
    cancel: CancellationToken,
}

impl AnalysisScheduler {
    /// Create a scheduler over the given engines
    pub fn new(
        config: SchedulerConfig,
        sessions: Arc<SessionCoordinator>,
        directory: Arc<AgentDirectory>,
        consensus: Arc<ConsensusEngine>,
        synthesis: Arc<InsightSynthesisEngine>,
    ) -> Self {
        Self {
            sessions,
            directory,
            consensus,
            synthesis,
            config,
            analyzed: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Run the ticker until [`shutdown`](Self::shutdown) is called. Also
    /// subscribes to the coordinator's append notifications so the
    /// message-count trigger fires without callers wiring it up by hand.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let mut appends = self.sessions.subscribe_appends();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_secs = self.config.interval_secs, "analysis scheduler started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("analysis scheduler stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.pass().await;
                    }
                    Some(session_id) = appends.recv() => {
                        self.message_appended(&session_id).await;
                    }
                }
            }
        })
    }

    /// Stop the background ticker
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Notify the scheduler that a session gained a message. Once enough
    /// new messages have accumulated since the last pass, spawns an
    /// analysis pass for that session; the notification itself returns
    /// without waiting for the engines.
    pub async fn message_appended(self: &Arc<Self>, session_id: &SessionId) {
        let Ok(last) = self.sessions.last_sequence(session_id).await else {
            return;
        };
        let analyzed = self
            .analyzed
            .lock()
            .await
            .get(session_id)
            .copied()
            .unwrap_or(0);

        if last.saturating_sub(analyzed) >= self.config.message_threshold {
            debug!(session_id = %session_id, new_messages = last - analyzed, "message threshold reached");
            let scheduler = Arc::clone(self);
            let session_id = session_id.clone();
            tokio::spawn(async move {
                scheduler.analyze_session(&session_id).await;
            });
        }
    }

    /// One full pass: analyze every active session, then run the
    /// housekeeping sweeps
    async fn pass(&self) {
        for session_id in self.sessions.active_sessions().await {
            if self.cancel.is_cancelled() {
                return;
            }
            self.analyze_session(&session_id).await;
        }

        let closed = self.sessions.close_idle().await;
        if !closed.is_empty() {
            info!(count = closed.len(), "idle sessions closed");
        }
        self.directory.sweep_expired().await;
    }

    /// Run one consensus round and one synthesis run for a session.
    /// Analysis failures are absorbed here; they never propagate.
    async fn analyze_session(&self, session_id: &SessionId) {
        let topic = match self.sessions.session(session_id).await {
            Ok(session) => session.topic,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "session gone before analysis");
                return;
            }
        };

        if let Err(e) = self.consensus.run_round(session_id, &topic).await {
            debug!(session_id = %session_id, error = %e, "consensus round skipped");
        }
        if let Err(e) = self.synthesis.synthesize(session_id).await {
            warn!(session_id = %session_id, error = %e, "synthesis run failed");
        }

        if let Ok(last) = self.sessions.last_sequence(session_id).await {
            self.analyzed.lock().await.insert(session_id.clone(), last);
        }
    }
}
