//! Scenario: a message with an invalid signature is dropped on ingress,
//! never reaching the receiver's application state (spec §8).

mod common;

use pulsemesh_core::signer::Signature;
use std::time::Duration;

#[tokio::test]
async fn message_with_invalid_signature_is_dropped_silently() {
    let (alice_id, alice, _alice_ingress, _dir_a) = common::start_transport("alice").await;
    let (bob_id, bob, _bob_ingress, _dir_b) = common::start_transport("bob").await;

    // Positive control: a normally-signed broadcast from alice must actually
    // reach bob first, proving the gossipsub mesh is up before the negative
    // path below is meaningful.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let probe = common::make_message(&alice_id, "alice", "ping");
        alice.send(probe).await.expect("transport not closed");
        if bob.snapshot_received().iter().any(|e| e.sender_id == alice_id.to_string()) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "gossipsub mesh never formed between alice and bob");
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    // Negative path: bob sends a message carrying a deliberately corrupt
    // signature envelope. Pre-setting it to `Some` skips transport's
    // auto-sign step, so it goes out exactly as forged.
    let mut forged = common::make_message(&bob_id, "bob", "forged");
    forged.resonance_signature = Some(Signature("not-a-real-envelope".into()));
    bob.send(forged).await.expect("transport not closed");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(
        !alice.snapshot_received().iter().any(|e| e.sender_id == bob_id.to_string()),
        "alice must discard a message whose signature fails verification"
    );
}
