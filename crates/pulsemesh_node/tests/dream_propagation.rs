//! Scenario: a dream stored on one node propagates to a peer and lands
//! tagged as shared (spec §8).

mod common;

use pulsemesh_node::federation::EchoGenerator;
use pulsemesh_node::persistence::RecordQuery;
use std::time::Duration;

#[tokio::test]
async fn stored_dream_propagates_to_peer_tagged_shared() {
    let (alice, alice_id, _persist_a, _dir_a) =
        common::start_federation("alice", EchoGenerator { model_id: "echo".into() }).await;
    let (bob, bob_id, bob_persistence, _dir_b) =
        common::start_federation("bob", EchoGenerator { model_id: "echo".into() }).await;

    assert!(common::wait_for_peer(&alice, &bob_id, Duration::from_secs(20)).await);
    assert!(common::wait_for_peer(&bob, &alice_id, Duration::from_secs(20)).await);

    let stored = alice
        .store_dream("I dreamed".into(), vec!["idle".into()])
        .await
        .expect("local store should succeed regardless of peers");
    assert_eq!(stored.content, "I dreamed");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let found = bob_persistence
            .retrieve(RecordQuery { tags: vec!["shared".into()], ..Default::default() })
            .await
            .expect("retrieve should not error");

        if let Some(record) = found.into_iter().find(|r| r.author_node_id == alice_id) {
            assert_eq!(record.content, "I dreamed");
            assert!(record.metadata.get("shared").and_then(|v| v.as_bool()).unwrap_or(false));
            break;
        }

        assert!(tokio::time::Instant::now() < deadline, "dream never propagated to bob's persistence");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    alice.shutdown().await;
    bob.shutdown().await;
}
