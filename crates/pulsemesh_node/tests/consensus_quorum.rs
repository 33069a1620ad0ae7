//! Scenario: two real peers reach quorum and the higher-confidence response
//! wins (spec §8).

mod common;

use pulsemesh_core::consensus::{ConsensusMethod, Response};
use pulsemesh_node::federation::{Generator, GeneratorError, RequestConsensusArgs};
use std::time::Duration;

struct FixedGenerator {
    content: &'static str,
    confidence: f64,
}

impl Generator for FixedGenerator {
    fn generate(&self, _prompt: &str, _system: Option<&str>, _history: &[String]) -> Result<Response, GeneratorError> {
        Ok(Response {
            content: self.content.to_string(),
            model_id: "fixed".into(),
            confidence: self.confidence,
            resonance: self.confidence,
            consent_verified: true,
        })
    }
}

#[tokio::test]
async fn two_peer_consensus_reaches_quorum_and_picks_higher_confidence() {
    let (alice, alice_id, _persist_a, _dir_a) =
        common::start_federation("alice", FixedGenerator { content: "from-alice", confidence: 0.5 }).await;
    let (bob, bob_id, _persist_b, _dir_b) =
        common::start_federation("bob", FixedGenerator { content: "from-bob", confidence: 0.9 }).await;

    assert!(
        common::wait_for_peer(&alice, &bob_id, Duration::from_secs(20)).await,
        "alice never discovered bob over gossipsub"
    );
    assert!(
        common::wait_for_peer(&bob, &alice_id, Duration::from_secs(20)).await,
        "bob never discovered alice over gossipsub"
    );

    let result = alice
        .request_consensus(RequestConsensusArgs {
            prompt: "how does the mesh feel".into(),
            system: None,
            history: vec![],
            min_participants: 2,
            timeout: Duration::from_secs(8),
            method: ConsensusMethod::WeightedConfidence,
        })
        .await
        .expect("consensus request should resolve");

    assert_eq!(result.content, "from-bob");
    assert_eq!(result.metadata.get("distributed").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(result.metadata.get("node_count").and_then(|v| v.as_u64()), Some(2));

    alice.shutdown().await;
    bob.shutdown().await;
}
