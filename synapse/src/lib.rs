//! Synapse - Agent Coordination Fabric
//!
//! Synapse is the shared coordination layer for fleets of cooperating
//! agents: a liveness-tracked directory for discovery, ordered coordination
//! sessions with gapless per-session message sequencing, weighted semantic
//! consensus over session contributions, and quality-gated synthesis of
//! emergent insights, all backed by an external content-searchable audit
//! store reached through a shared circuit breaker.
//!
//! # Architecture
//!
//! - `directory` - agent registry with heartbeat liveness and capability
//!   discovery
//! - `session` - coordination sessions, message ordering, and fan-out
//!   delivery
//! - `consensus` - weighted semantic voting over session contributions
//! - `synthesis` - emergent insight detection and quality gating
//! - `scheduler` - background analysis triggering
//! - `resilience` - shared circuit breaker for external store calls
//! - `audit` / `quality` / `transport` - external collaborator interfaces
//! - `config` / `types` - configuration and shared identifier types

#![warn(missing_docs)]

// Coordination fabric modules
pub mod consensus;
pub mod directory;
pub mod scheduler;
pub mod session;
pub mod synthesis;

// External collaborators
pub mod audit;
pub mod quality;
pub mod transport;

// Shared infrastructure
pub mod config;
pub mod resilience;
pub mod types;

// Re-export the fabric's main surface
pub use config::SynapseConfig;
pub use consensus::{ConsensusEngine, ConsensusRound, Resolution};
pub use directory::{AgentDirectory, AgentRecord, AgentRegistration, AgentStatus};
pub use scheduler::AnalysisScheduler;
pub use session::{CoordinationSession, SessionCoordinator, SessionMode, SessionStatus};
pub use synthesis::{EmergentInsight, InsightCategory, InsightSynthesisEngine};
pub use types::{AgentId, InsightId, MessageId, RecordId, RoundId, SessionId};

/// Synapse version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
