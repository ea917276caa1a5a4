//! Fabric Configuration
//!
//! Typed configuration for every component of the coordination fabric.
//! Every section has hardcoded fallback defaults so the fabric can start
//! without a config file; `SynapseConfig::load` reads a TOML overlay.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration for the coordination fabric
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SynapseConfig {
    /// Agent directory settings
    pub directory: DirectoryConfig,

    /// Session and messaging settings
    pub session: SessionConfig,

    /// Message delivery settings
    pub delivery: DeliveryConfig,

    /// Consensus engine settings
    pub consensus: ConsensusConfig,

    /// Insight synthesis settings
    pub synthesis: SynthesisConfig,

    /// Circuit breaker settings for external store calls
    pub breaker: BreakerConfig,

    /// Background analysis scheduling settings
    pub scheduler: SchedulerConfig,

    /// External store endpoints
    pub store: StoreConfig,
}

impl SynapseConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// any missing section.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Agent directory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Heartbeat TTL in seconds; records without a heartbeat within this
    /// window are reported as stale
    pub ttl_secs: u64,

    /// Grace period in seconds past 2x TTL before a record becomes
    /// eligible for garbage collection
    pub gc_grace_secs: u64,

    /// Default discovery timeout in milliseconds
    pub discover_timeout_ms: u64,

    /// Default maximum number of records returned by discovery
    pub discover_limit: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 90,
            gc_grace_secs: 300,
            discover_timeout_ms: 2_000,
            discover_limit: 50,
        }
    }
}

impl DirectoryConfig {
    /// Heartbeat TTL as a `Duration`
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Session and messaging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions with no message activity for this many seconds are closed
    /// by the scheduler sweep
    pub idle_timeout_secs: u64,

    /// Maximum number of messages returned per history page
    pub history_page_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 3_600,
            history_page_limit: 200,
        }
    }
}

/// Message delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Maximum delivery attempts per recipient before a message is parked
    /// as pending for that recipient
    pub max_attempts: u32,

    /// Initial backoff between delivery retries in milliseconds; doubles
    /// per attempt
    pub initial_backoff_ms: u64,

    /// Upper bound on the per-attempt backoff in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

/// Consensus engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Weighted agreement ratio required for an `Agreed` resolution
    pub agreement_threshold: f32,

    /// Pairwise similarity at or above which two positions are considered
    /// aligned
    pub similarity_threshold: f32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            agreement_threshold: 0.9,
            similarity_threshold: 0.6,
        }
    }
}

/// Insight synthesis settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Minimum quality-gate score required to persist an insight
    pub quality_threshold: f32,

    /// Minimum number of distinct agents that must echo a claim before it
    /// counts as a breakthrough
    pub min_echoing_agents: usize,

    /// Similarity at or above which a later message counts as echoing an
    /// earlier claim
    pub echo_similarity: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 0.7,
            min_echoing_agents: 2,
            echo_similarity: 0.5,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Number of failures within the rolling window that opens the circuit
    pub failure_threshold: u32,

    /// Rolling failure window in seconds
    pub window_secs: u64,

    /// Cooldown in seconds while the circuit stays open before a probe is
    /// admitted
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            cooldown_secs: 30,
        }
    }
}

impl BreakerConfig {
    /// Rolling failure window as a `Duration`
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Open-state cooldown as a `Duration`
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Background analysis scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fixed cadence between analysis passes in seconds
    pub interval_secs: u64,

    /// Number of new messages in a session that triggers an immediate
    /// analysis pass for that session
    pub message_threshold: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 45,
            message_threshold: 8,
        }
    }
}

/// External store endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the audit store API
    pub audit_base_url: String,

    /// Base URL of the quality gate API
    pub quality_base_url: String,

    /// Request timeout for store calls in seconds
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            audit_base_url: "http://localhost:8010".to_string(),
            quality_base_url: "http://localhost:8011".to_string(),
            request_timeout_secs: 10,
        }
    }
}
