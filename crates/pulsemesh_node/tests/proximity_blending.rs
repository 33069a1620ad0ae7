//! Scenario: a nearby peer's emotional state blends into local state
//! proportional to measured proximity (spec §8: joy 0.5 local, 1.0 remote,
//! RSSI yielding proximity 1.0 and blend weight 0.3 -> joy settles at 0.65).

mod common;

use pulsemesh_core::consensus::ConsensusMethod;
use pulsemesh_core::consent::AlwaysGrantConsent;
use pulsemesh_core::ids::NodeId;
use pulsemesh_core::signer::Signer;
use pulsemesh_core::vector::{EmotionalScalars, EmotionalVector};
use pulsemesh_node::federation::{EchoGenerator, FederationConfig, FederationNode};
use pulsemesh_node::persistence::PersistenceLayer;
use pulsemesh_node::proximity::{encode_beacon, LoopbackProximityBackend, ProximityLayer};
use pulsemesh_node::security::NodeSigner;
use pulsemesh_node::telemetry::TracingTelemetry;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn nearby_peer_emotion_blends_into_local_state() {
    let (node_id, transport, ingress, dir) = common::start_transport("alice").await;
    let persistence_signer: Arc<dyn Signer> =
        Arc::new(NodeSigner::new(&dir.path().join("persistence-signing.key")).expect("key init"));
    let persistence = PersistenceLayer::start(
        dir.path().to_path_buf(),
        node_id.clone(),
        "alice".into(),
        Some(persistence_signer),
        Some(Arc::new(AlwaysGrantConsent)),
    );

    // RSSI 20 -> clamp((20+40)/60, 0, 1) == 1.0, matching proximity.rs's own
    // `proximity_is_clamped_from_rssi` test.
    let backend = Arc::new(LoopbackProximityBackend::new(20.0));
    let proximity = Arc::new(ProximityLayer::new(backend.clone(), node_id.clone(), "alice".into()));

    let config = FederationConfig {
        local_node_id: node_id.clone(),
        local_node_name: "alice".into(),
        broadcast_interval: Duration::from_secs(3600),
        advertise_interval: Duration::from_secs(3600),
        scan_interval: Duration::from_millis(50),
        default_min_participants: 1,
        default_timeout: Duration::from_secs(5),
        default_method: ConsensusMethod::WeightedConfidence,
    };

    let local_emotion = EmotionalVector::from_scalars(EmotionalScalars { joy: 0.5, ..EmotionalScalars::neutral() });
    let generator = EchoGenerator { model_id: "echo".into() };
    let federation = FederationNode::start(
        config,
        transport,
        ingress,
        persistence,
        proximity,
        generator,
        local_emotion,
        Arc::new(TracingTelemetry::new()),
        None,
    );

    let bob_id = NodeId::generate();
    let beacon = encode_beacon(&bob_id, "bob", &EmotionalScalars { joy: 1.0, ..EmotionalScalars::neutral() });
    backend.emit(beacon).await;

    tokio::time::sleep(Duration::from_millis(500)).await;

    let snapshot = federation.snapshot().await.expect("coordinator should respond to snapshot");
    let joy = snapshot.local_emotion.scalars().joy;
    assert!((joy - 0.65).abs() < 0.02, "expected joy near 0.65 after one proximity blend tick, got {joy}");

    federation.shutdown().await;
}
