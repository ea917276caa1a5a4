//! Common test utilities for synapse tests
//!
//! Builds a fully wired in-process fabric: in-memory audit store, a
//! configurable quality gate, channel transport, and all engines sharing
//! one circuit breaker.

use std::collections::HashSet;
use std::sync::Arc;

use synapse::audit::MemoryAuditStore;
use synapse::config::{
    BreakerConfig, ConsensusConfig, DeliveryConfig, DirectoryConfig, SessionConfig,
    SynthesisConfig,
};
use synapse::consensus::ConsensusEngine;
use synapse::directory::{AgentDirectory, AgentRegistration};
use synapse::quality::{FixedQualityGate, QualityGate};
use synapse::resilience::CircuitBreaker;
use synapse::session::delivery::DeliveryManager;
use synapse::session::{SessionCoordinator, SessionExtension, SessionMode};
use synapse::synthesis::InsightSynthesisEngine;
use synapse::transport::{ChannelTransport, Transport};
use synapse::types::{AgentId, SessionId};

/// A fully wired in-process coordination fabric
pub struct Fabric {
    pub directory: Arc<AgentDirectory>,
    pub sessions: Arc<SessionCoordinator>,
    pub consensus: Arc<ConsensusEngine>,
    pub synthesis: Arc<InsightSynthesisEngine>,
    pub audit: Arc<MemoryAuditStore>,
    pub transport: Arc<ChannelTransport>,
    pub breaker: Arc<CircuitBreaker>,
}

impl Fabric {
    /// Build a fabric with an always-passing quality gate
    pub fn new() -> Self {
        Self::with_gate(Arc::new(FixedQualityGate::passing(0.9)))
    }

    /// Build a fabric with a specific quality gate
    pub fn with_gate(gate: Arc<dyn QualityGate>) -> Self {
        // RUST_LOG controls per-test trace output; only the first fabric in
        // a process installs the subscriber
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let breaker = Arc::new(CircuitBreaker::new("stores", BreakerConfig::default()));
        let audit = Arc::new(MemoryAuditStore::new());
        let transport = Arc::new(ChannelTransport::new());

        let directory = Arc::new(AgentDirectory::with_audit(
            DirectoryConfig::default(),
            Arc::clone(&breaker),
            audit.clone(),
        ));
        let delivery = Arc::new(DeliveryManager::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            DeliveryConfig::default(),
        ));
        let sessions = Arc::new(SessionCoordinator::with_audit(
            SessionConfig::default(),
            Arc::clone(&directory),
            delivery,
            Arc::clone(&breaker),
            audit.clone(),
        ));
        let consensus = Arc::new(ConsensusEngine::with_audit(
            ConsensusConfig::default(),
            Arc::clone(&sessions),
            Arc::clone(&directory),
            Arc::clone(&breaker),
            audit.clone(),
        ));
        let synthesis = Arc::new(InsightSynthesisEngine::with_audit(
            SynthesisConfig::default(),
            Arc::clone(&sessions),
            gate,
            Arc::clone(&breaker),
            audit.clone(),
        ));

        Self {
            directory,
            sessions,
            consensus,
            synthesis,
            audit,
            transport,
            breaker,
        }
    }

    /// Register an agent with the given capabilities and default trust
    pub async fn register(&self, id: &str, capabilities: &[&str]) -> AgentId {
        self.register_weighted(id, capabilities, None).await
    }

    /// Register an agent with an explicit trust weight
    pub async fn register_weighted(
        &self,
        id: &str,
        capabilities: &[&str],
        trust_weight: Option<f32>,
    ) -> AgentId {
        self.directory
            .register(AgentRegistration {
                id: AgentId::from_string(id),
                display_name: id.to_string(),
                capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
                endpoint: format!("inproc://{id}"),
                trust_weight,
            })
            .await
            .unwrap()
    }

    /// Create a collaborative session over the given participants
    pub async fn session(&self, topic: &str, participants: &[&str]) -> SessionId {
        self.sessions
            .create(
                format!("{topic} session"),
                participants
                    .iter()
                    .map(|p| AgentId::from_string(*p))
                    .collect(),
                SessionMode::Collaborative,
                topic,
                HashSet::<SessionExtension>::new(),
            )
            .await
            .unwrap()
    }
}
