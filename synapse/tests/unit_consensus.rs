//! Unit tests for the consensus engine
//!
//! Tests cover:
//! - Resolution policy: agreed, compromise, unresolved
//! - Trust-weighted tallies
//! - In-flight deduplication per session and topic
//! - Round results written back into the session

mod common;

use common::Fabric;
use futures::future::join_all;
use std::collections::HashSet;
use synapse::consensus::{ConsensusError, Resolution};
use synapse::session::message::MessageKind;
use synapse::types::AgentId;

async fn contribute(fabric: &Fabric, session: &synapse::types::SessionId, from: &str, text: &str) {
    fabric
        .sessions
        .send(
            session,
            AgentId::from_string(from),
            None,
            MessageKind::Contribution,
            text,
            HashSet::new(),
        )
        .await
        .unwrap();
}

// ============================================================================
// Resolution policy
// ============================================================================

#[tokio::test]
async fn test_identical_positions_resolve_agreed() {
    let fabric = Fabric::new();
    fabric.register("a", &["planning"]).await;
    fabric.register("b", &["analysis"]).await;
    let session = fabric.session("caching", &["a", "b"]).await;

    contribute(&fabric, &session, "a", "Adopt the write-through cache design").await;
    contribute(&fabric, &session, "b", "Adopt the write-through cache design").await;

    let round = fabric.consensus.run_round(&session, "caching").await.unwrap();
    assert_eq!(round.resolution, Resolution::Agreed);
    assert_eq!(round.votes.len(), 2);
}

#[tokio::test]
async fn test_distant_positions_never_resolve_agreed() {
    let fabric = Fabric::new();
    fabric.register("a", &["planning"]).await;
    fabric.register("b", &["analysis"]).await;
    let session = fabric.session("caching", &["a", "b"]).await;

    contribute(&fabric, &session, "a", "Adopt blue deployment tomorrow").await;
    contribute(&fabric, &session, "b", "Rewrite everything in assembly first").await;

    let round = fabric.consensus.run_round(&session, "caching").await.unwrap();
    assert_ne!(round.resolution, Resolution::Agreed);
    assert_eq!(round.resolution, Resolution::Unresolved);
    assert!(round.compromise_text.is_none());
}

#[tokio::test]
async fn test_partial_overlap_resolves_compromise() {
    let fabric = Fabric::new();
    for agent in ["a", "b", "c"] {
        fabric.register(agent, &["planning"]).await;
    }
    let session = fabric.session("caching", &["a", "b", "c"]).await;

    contribute(&fabric, &session, "a", "Adopt the write-through cache design").await;
    contribute(&fabric, &session, "b", "Adopt the write-through cache design").await;
    contribute(
        &fabric,
        &session,
        "c",
        "Adopt the write-through cache design. But only after load testing finishes.",
    )
    .await;

    let round = fabric.consensus.run_round(&session, "caching").await.unwrap();
    assert_eq!(round.resolution, Resolution::Compromise);
    let text = round.compromise_text.unwrap();
    assert!(text.starts_with("Shared ground:"));
    assert!(text.contains("write-through cache"));
}

#[tokio::test]
async fn test_vote_keys_are_participants() {
    let fabric = Fabric::new();
    fabric.register("a", &["planning"]).await;
    fabric.register("b", &["analysis"]).await;
    let session = fabric.session("caching", &["a", "b"]).await;

    contribute(&fabric, &session, "a", "Ship the cache next week").await;
    contribute(&fabric, &session, "b", "Ship the cache next week").await;

    let round = fabric.consensus.run_round(&session, "caching").await.unwrap();
    for voter in round.votes.keys() {
        assert!(["a", "b"].contains(&voter.as_str()));
    }
}

// ============================================================================
// Trust weighting
// ============================================================================

#[tokio::test]
async fn test_heavy_dissenter_blocks_agreement() {
    let fabric = Fabric::new();
    fabric.register_weighted("a", &["planning"], Some(1.0)).await;
    fabric.register_weighted("b", &["planning"], Some(1.0)).await;
    fabric.register_weighted("c", &["review"], Some(20.0)).await;
    let session = fabric.session("deploy", &["a", "b", "c"]).await;

    contribute(&fabric, &session, "a", "Adopt blue deployment tomorrow").await;
    contribute(&fabric, &session, "b", "Adopt blue deployment tomorrow").await;
    contribute(&fabric, &session, "c", "Rewrite everything in assembly first").await;

    let round = fabric.consensus.run_round(&session, "deploy").await.unwrap();
    assert_ne!(round.resolution, Resolution::Agreed);
}

#[tokio::test]
async fn test_light_dissenter_cannot_block_agreement() {
    let fabric = Fabric::new();
    fabric.register_weighted("a", &["planning"], Some(1.0)).await;
    fabric.register_weighted("b", &["planning"], Some(1.0)).await;
    fabric.register_weighted("c", &["review"], Some(0.01)).await;
    let session = fabric.session("deploy", &["a", "b", "c"]).await;

    contribute(&fabric, &session, "a", "Adopt blue deployment tomorrow").await;
    contribute(&fabric, &session, "b", "Adopt blue deployment tomorrow").await;
    contribute(&fabric, &session, "c", "Rewrite everything in assembly first").await;

    let round = fabric.consensus.run_round(&session, "deploy").await.unwrap();
    assert_eq!(round.resolution, Resolution::Agreed);
}

// ============================================================================
// Failure and concurrency
// ============================================================================

#[tokio::test]
async fn test_round_without_contributions_fails_with_no_messages() {
    let fabric = Fabric::new();
    fabric.register("a", &["planning"]).await;
    fabric.register("b", &["analysis"]).await;
    let session = fabric.session("caching", &["a", "b"]).await;

    // Updates are not positions
    fabric
        .sessions
        .send(
            &session,
            AgentId::from_string("a"),
            None,
            MessageKind::Update,
            "still reading the design doc",
            HashSet::new(),
        )
        .await
        .unwrap();

    let err = fabric.consensus.run_round(&session, "caching").await.unwrap_err();
    assert!(matches!(err, ConsensusError::NoMessages { .. }));
}

#[tokio::test]
async fn test_concurrent_rounds_share_one_execution() {
    let fabric = Fabric::new();
    fabric.register("a", &["planning"]).await;
    fabric.register("b", &["analysis"]).await;
    let session = fabric.session("caching", &["a", "b"]).await;

    contribute(&fabric, &session, "a", "Adopt the write-through cache design").await;
    contribute(&fabric, &session, "b", "Adopt the write-through cache design").await;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let consensus = fabric.consensus.clone();
            let session = session.clone();
            tokio::spawn(async move { consensus.run_round(&session, "caching").await })
        })
        .collect();

    let mut round_ids = HashSet::new();
    for result in join_all(tasks).await {
        match result.unwrap() {
            // Callers that raced the leader observe its round
            Ok(round) => {
                round_ids.insert(round.id);
            }
            // Callers that arrived after it finished see no new messages
            Err(ConsensusError::NoMessages { .. }) => {}
            Err(other) => panic!("unexpected consensus error: {other}"),
        }
    }
    assert_eq!(round_ids.len(), 1);
}

#[tokio::test]
async fn test_round_outcome_written_back_as_decision() {
    let fabric = Fabric::new();
    fabric.register("a", &["planning"]).await;
    fabric.register("b", &["analysis"]).await;
    let session = fabric.session("caching", &["a", "b"]).await;

    contribute(&fabric, &session, "a", "Adopt the write-through cache design").await;
    contribute(&fabric, &session, "b", "Adopt the write-through cache design").await;
    fabric.consensus.run_round(&session, "caching").await.unwrap();

    let history = fabric.sessions.history(&session, None, None).await.unwrap();
    let decision = history
        .iter()
        .find(|m| m.kind == MessageKind::Decision && m.from_agent_id == AgentId::system())
        .expect("round outcome should be appended to the session");
    assert!(decision.content.contains("caching"));
}
