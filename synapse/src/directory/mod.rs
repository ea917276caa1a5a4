//! Agent Directory
//!
//! Registration and capability-based discovery for independently running
//! agents, with heartbeat/TTL liveness semantics. The directory is an
//! explicitly constructed instance injected into every component that needs
//! it; the in-memory registry is authoritative and doubles as the
//! last-known-good snapshot when the audit store degrades. Registrations are
//! mirrored to the store best-effort through the circuit breaker and a
//! mirror failure never surfaces to the caller.

use crate::audit::AuditStore;
use crate::config::DirectoryConfig;
use crate::resilience::CircuitBreaker;
use crate::types::AgentId;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Directory errors
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Registration carried an empty capability set
    #[error("agent {0} registered with an empty capability set")]
    InvalidCapabilitySet(AgentId),
}

/// Result type for directory operations
pub type Result<T> = std::result::Result<T, DirectoryError>;

/// Liveness status of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Heartbeat seen within the TTL
    Online,
    /// No heartbeat within the TTL
    Stale,
    /// No heartbeat within twice the TTL
    Offline,
}

/// One directory entry describing an addressable agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Unique agent id
    pub id: AgentId,

    /// Human-readable name
    pub display_name: String,

    /// Advertised capabilities, never empty
    pub capabilities: HashSet<String>,

    /// Opaque transport descriptor
    pub endpoint: String,

    /// Liveness status as of the last directory operation
    pub status: AgentStatus,

    /// When the agent first registered
    pub registered_at: DateTime<Utc>,

    /// Last heartbeat or registration
    pub last_seen_at: DateTime<Utc>,

    /// Vote weight applied by the consensus engine
    pub trust_weight: f32,
}

/// Registration payload for [`AgentDirectory::register`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    /// Agent id; registering an existing id replaces its record
    pub id: AgentId,

    /// Human-readable name
    pub display_name: String,

    /// Advertised capabilities, must be non-empty
    pub capabilities: HashSet<String>,

    /// Opaque transport descriptor
    pub endpoint: String,

    /// Vote weight, defaults to 1.0
    #[serde(default)]
    pub trust_weight: Option<f32>,
}

/// Discovery query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryFilter {
    /// Match agents advertising at least one of these capabilities;
    /// `None` matches all agents
    pub capabilities: Option<HashSet<String>>,

    /// Statuses to include; defaults to online only
    pub status_in: Option<Vec<AgentStatus>>,

    /// Maximum records to return; defaults to the configured limit
    pub limit: Option<usize>,

    /// Per-call timeout; defaults to the configured discovery timeout.
    /// On timeout the call returns whatever matched so far.
    pub timeout: Option<Duration>,
}

/// Capability directory with heartbeat/TTL liveness
pub struct AgentDirectory {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
    config: DirectoryConfig,
    audit: Option<Arc<dyn AuditStore>>,
    breaker: Arc<CircuitBreaker>,
}

impl AgentDirectory {
    /// Create a directory without audit mirroring
    pub fn new(config: DirectoryConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            config,
            audit: None,
            breaker,
        }
    }

    /// Create a directory that mirrors registrations to the audit store
    pub fn with_audit(
        config: DirectoryConfig,
        breaker: Arc<CircuitBreaker>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            config,
            audit: Some(audit),
            breaker,
        }
    }

    /// Register or re-register an agent. Idempotent by id: registering an
    /// existing id replaces its capabilities and endpoint while keeping the
    /// original `registered_at`.
    pub async fn register(&self, registration: AgentRegistration) -> Result<AgentId> {
        if registration.capabilities.is_empty() {
            return Err(DirectoryError::InvalidCapabilitySet(registration.id));
        }

        let now = Utc::now();
        let id = registration.id.clone();

        {
            let mut agents = self.agents.write().await;
            let registered_at = agents
                .get(&id)
                .map(|existing| existing.registered_at)
                .unwrap_or(now);

            agents.insert(
                id.clone(),
                AgentRecord {
                    id: id.clone(),
                    display_name: registration.display_name.clone(),
                    capabilities: registration.capabilities.clone(),
                    endpoint: registration.endpoint.clone(),
                    status: AgentStatus::Online,
                    registered_at,
                    last_seen_at: now,
                    trust_weight: registration.trust_weight.unwrap_or(1.0),
                },
            );
        }

        info!(agent_id = %id, "agent registered");
        self.mirror(
            format!("agent {} registered", registration.display_name),
            "agent_registered",
            &id,
        );

        Ok(id)
    }

    /// Record a heartbeat, flipping a stale record back to online.
    /// A heartbeat for an unknown agent is ignored.
    pub async fn heartbeat(&self, id: &AgentId) {
        let mut agents = self.agents.write().await;
        match agents.get_mut(id) {
            Some(record) => {
                record.last_seen_at = Utc::now();
                if record.status != AgentStatus::Online {
                    debug!(agent_id = %id, "agent back online");
                }
                record.status = AgentStatus::Online;
            }
            None => warn!(agent_id = %id, "heartbeat for unknown agent"),
        }
    }

    /// Discover agents matching the filter.
    ///
    /// Capability matching requires a non-empty intersection with the
    /// advertised set. Records past the TTL are reported stale and excluded
    /// unless the filter asks for them; records past twice the TTL are
    /// treated as offline but are not deleted here (see
    /// [`AgentDirectory::sweep_expired`]).
    pub async fn discover(&self, filter: &DiscoveryFilter) -> Vec<AgentRecord> {
        let deadline = filter
            .timeout
            .unwrap_or(Duration::from_millis(self.config.discover_timeout_ms));

        // The registry is in-memory so the only wait is lock acquisition;
        // on timeout return what matched so far, i.e. nothing.
        let agents = match timeout(deadline, self.agents.read()).await {
            Ok(guard) => guard,
            Err(_) => {
                warn!("discovery timed out waiting for the registry");
                return Vec::new();
            }
        };

        let now = Utc::now();
        let limit = filter.limit.unwrap_or(self.config.discover_limit);
        let wanted: &[AgentStatus] = match &filter.status_in {
            Some(statuses) => statuses,
            None => &[AgentStatus::Online],
        };

        let mut matched: Vec<AgentRecord> = agents
            .values()
            .filter(|record| match &filter.capabilities {
                Some(required) if !required.is_empty() => {
                    record.capabilities.intersection(required).next().is_some()
                }
                _ => true,
            })
            .filter_map(|record| {
                let status = self.effective_status(record, now);
                if wanted.contains(&status) {
                    let mut record = record.clone();
                    record.status = status;
                    Some(record)
                } else {
                    None
                }
            })
            .collect();

        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched.truncate(limit);
        matched
    }

    /// Remove an agent. Idempotent: removing an absent id is a no-op.
    pub async fn deregister(&self, id: &AgentId) {
        let removed = self.agents.write().await.remove(id);
        if let Some(record) = removed {
            info!(agent_id = %id, "agent deregistered");
            self.mirror(
                format!("agent {} deregistered", record.display_name),
                "agent_deregistered",
                id,
            );
        }
    }

    /// Delete records with no heartbeat for twice the TTL plus the grace
    /// period. Intended for the background sweep; discovery never deletes.
    pub async fn sweep_expired(&self) -> usize {
        let cutoff = Utc::now()
            - ChronoDuration::seconds((self.config.ttl_secs * 2 + self.config.gc_grace_secs) as i64);

        let mut agents = self.agents.write().await;
        let before = agents.len();
        agents.retain(|_, record| record.last_seen_at >= cutoff);
        let swept = before - agents.len();

        if swept > 0 {
            info!(swept, "swept expired agent records");
        }
        swept
    }

    /// Look up a single record by id. The returned status reflects
    /// heartbeat age, same as [`discover`](Self::discover).
    pub async fn get(&self, id: &AgentId) -> Option<AgentRecord> {
        let now = Utc::now();
        self.agents.read().await.get(id).map(|record| {
            let mut record = record.clone();
            record.status = self.effective_status(&record, now);
            record
        })
    }

    /// Whether an agent is currently registered
    pub async fn contains(&self, id: &AgentId) -> bool {
        self.agents.read().await.contains_key(id)
    }

    /// Trust weight for an agent, 1.0 when unknown
    pub async fn trust_weight(&self, id: &AgentId) -> f32 {
        self.agents
            .read()
            .await
            .get(id)
            .map(|record| record.trust_weight)
            .unwrap_or(1.0)
    }

    /// Number of registered agents, including stale and offline records
    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    fn effective_status(&self, record: &AgentRecord, now: DateTime<Utc>) -> AgentStatus {
        let age = now.signed_duration_since(record.last_seen_at);
        let ttl = ChronoDuration::seconds(self.config.ttl_secs as i64);

        if age > ttl * 2 {
            AgentStatus::Offline
        } else if age > ttl {
            AgentStatus::Stale
        } else {
            record.status
        }
    }

    /// Mirror a directory event to the audit store, best-effort
    fn mirror(&self, content: String, event: &'static str, id: &AgentId) {
        let Some(audit) = self.audit.clone() else {
            return;
        };
        let breaker = Arc::clone(&self.breaker);
        let mut metadata = HashMap::new();
        metadata.insert("kind".to_string(), json!(event));
        metadata.insert("agent_id".to_string(), json!(id.to_string()));

        tokio::spawn(async move {
            if let Err(e) = breaker.call(|| audit.append(content, metadata)).await {
                warn!(error = %e, "failed to mirror directory event to audit store");
            }
        });
    }
}
