//! Scenario: egress is refused when consent is denied, before anything
//! touches the wire (spec §8).

mod common;

use pulsemesh_core::consent::{AlwaysDenyConsent, Consent};
use pulsemesh_core::ids::NodeId;
use pulsemesh_core::wire::WireCodec;
use pulsemesh_node::security::NodeSigner;
use pulsemesh_node::telemetry::TracingTelemetry;
use pulsemesh_node::transport::{TransportError, TransportLayer};
use std::sync::Arc;

#[tokio::test]
async fn send_with_denied_consent_is_rejected_before_it_reaches_the_wire() {
    let node_id = NodeId::generate();
    let dir = tempfile::tempdir().expect("tempdir");
    let signer = Arc::new(NodeSigner::new(&dir.path().join("signing.key")).expect("key init"));
    let consent: Arc<dyn Consent> = Arc::new(AlwaysDenyConsent);
    let keypair = libp2p::identity::Keypair::generate_ed25519();

    let (transport, _ingress) = TransportLayer::start(
        node_id.clone(),
        "solo".into(),
        keypair,
        Arc::new(WireCodec::new()),
        Some(signer),
        Some(consent),
        Arc::new(TracingTelemetry::new()),
        None,
    )
    .await
    .expect("transport starts");

    let message = common::make_message(&node_id, "solo", "hello mesh");
    let result = transport.send(message).await;

    assert!(matches!(result, Err(TransportError::ConsentDenied)));
    assert!(transport.snapshot_sent().is_empty(), "a denied message must never be queued for egress");
}
