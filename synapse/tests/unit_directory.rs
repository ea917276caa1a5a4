//! Unit tests for the agent directory
//!
//! Tests cover:
//! - Registration validation and idempotent re-registration
//! - Capability-intersection discovery
//! - Status filtering and result limits
//! - Deregistration and heartbeat semantics

mod common;

use common::Fabric;
use std::collections::HashSet;
use synapse::directory::{AgentRegistration, AgentStatus, DirectoryError, DiscoveryFilter};
use synapse::types::AgentId;

fn capabilities(caps: &[&str]) -> Option<HashSet<String>> {
    Some(caps.iter().map(|c| c.to_string()).collect())
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_register_rejects_empty_capabilities() {
    let fabric = Fabric::new();
    let err = fabric
        .directory
        .register(AgentRegistration {
            id: AgentId::from_string("empty"),
            display_name: "empty".to_string(),
            capabilities: HashSet::new(),
            endpoint: "inproc://empty".to_string(),
            trust_weight: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DirectoryError::InvalidCapabilitySet(_)));
    assert!(!fabric.directory.contains(&AgentId::from_string("empty")).await);
}

#[tokio::test]
async fn test_reregistration_replaces_without_duplicating() {
    let fabric = Fabric::new();
    fabric.register("planner", &["planning"]).await;
    fabric.register("planner", &["planning", "estimation"]).await;

    assert_eq!(fabric.directory.len().await, 1);
    let record = fabric
        .directory
        .get(&AgentId::from_string("planner"))
        .await
        .unwrap();
    assert!(record.capabilities.contains("estimation"));
}

#[tokio::test]
async fn test_reregistration_keeps_original_registration_time() {
    let fabric = Fabric::new();
    fabric.register("planner", &["planning"]).await;
    let first = fabric
        .directory
        .get(&AgentId::from_string("planner"))
        .await
        .unwrap()
        .registered_at;

    fabric.register("planner", &["estimation"]).await;
    let second = fabric
        .directory
        .get(&AgentId::from_string("planner"))
        .await
        .unwrap()
        .registered_at;
    assert_eq!(first, second);
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn test_discover_matches_by_capability_intersection() {
    let fabric = Fabric::new();
    fabric.register("a", &["planning"]).await;
    fabric.register("b", &["analysis"]).await;

    let found = fabric
        .directory
        .discover(&DiscoveryFilter {
            capabilities: capabilities(&["analysis"]),
            ..Default::default()
        })
        .await;

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id.as_str(), "b");
}

#[tokio::test]
async fn test_discover_without_filter_returns_all_online() {
    let fabric = Fabric::new();
    fabric.register("a", &["planning"]).await;
    fabric.register("b", &["analysis"]).await;
    fabric.register("c", &["review"]).await;

    let found = fabric.directory.discover(&DiscoveryFilter::default()).await;
    assert_eq!(found.len(), 3);
    assert!(found.iter().all(|r| r.status == AgentStatus::Online));
}

#[tokio::test]
async fn test_discover_respects_limit() {
    let fabric = Fabric::new();
    for i in 0..5 {
        fabric.register(&format!("agent-{i}"), &["analysis"]).await;
    }

    let found = fabric
        .directory
        .discover(&DiscoveryFilter {
            limit: Some(2),
            ..Default::default()
        })
        .await;
    assert_eq!(found.len(), 2);
}

#[tokio::test]
async fn test_discover_requires_overlap_not_equality() {
    let fabric = Fabric::new();
    fabric.register("generalist", &["planning", "analysis", "review"]).await;

    let found = fabric
        .directory
        .discover(&DiscoveryFilter {
            capabilities: capabilities(&["analysis", "benchmarking"]),
            ..Default::default()
        })
        .await;
    assert_eq!(found.len(), 1);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_deregister_is_idempotent() {
    let fabric = Fabric::new();
    let id = fabric.register("a", &["planning"]).await;

    fabric.directory.deregister(&id).await;
    fabric.directory.deregister(&id).await;
    assert!(!fabric.directory.contains(&id).await);
}

#[tokio::test]
async fn test_heartbeat_for_unknown_agent_is_ignored() {
    let fabric = Fabric::new();
    fabric.directory.heartbeat(&AgentId::from_string("ghost")).await;
    assert!(fabric.directory.is_empty().await);
}

#[tokio::test]
async fn test_registration_mirrored_to_audit_store() {
    let fabric = Fabric::new();
    fabric.register("a", &["planning"]).await;

    // Mirroring is spawned; give it a moment to land
    tokio::task::yield_now().await;
    for _ in 0..50 {
        if !fabric.audit.is_empty().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("registration was not mirrored to the audit store");
}
