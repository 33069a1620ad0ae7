//! Scenario: a consensus request with no peers falls back to the local
//! response once its deadline passes (spec §8).

mod common;

use pulsemesh_core::consensus::ConsensusMethod;
use pulsemesh_node::federation::{EchoGenerator, RequestConsensusArgs};
use std::time::Duration;

#[tokio::test]
async fn request_without_peers_falls_back_to_local_response_after_timeout() {
    let (node, _node_id, _persist, _dir) =
        common::start_federation("solo", EchoGenerator { model_id: "echo".into() }).await;

    let result = tokio::time::timeout(
        Duration::from_secs(3),
        node.request_consensus(RequestConsensusArgs {
            prompt: "solo prompt".into(),
            system: None,
            history: vec![],
            min_participants: 2,
            timeout: Duration::from_millis(150),
            method: ConsensusMethod::WeightedConfidence,
        }),
    )
    .await
    .expect("should resolve well within the outer test timeout")
    .expect("echo generator never fails");

    assert_eq!(result.content, "solo prompt");
    assert_eq!(result.metadata.get("distributed").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(result.metadata.get("node_count").and_then(|v| v.as_u64()), Some(1));

    node.shutdown().await;
}
