//! Shared node-wiring helpers for the end-to-end tests in this directory.
//! Every helper spins up real libp2p swarms (spec §8's scenarios are about
//! the wire, not a mock of it); the only thing ever faked is the proximity
//! radio, via `LoopbackProximityBackend`.

#![allow(dead_code)]

use pulsemesh_core::consent::{AlwaysGrantConsent, Consent};
use pulsemesh_core::consensus::ConsensusMethod;
use pulsemesh_core::ids::{MessageId, NodeId};
use pulsemesh_core::signer::Signer;
use pulsemesh_core::vector::{EmotionalScalars, EmotionalVector};
use pulsemesh_core::wire::{FoldPattern, Intent, Layer, Message, Priority, ScaleLevel, WireCodec};
use pulsemesh_node::federation::{FederationConfig, FederationHandle, FederationNode, Generator};
use pulsemesh_node::persistence::{PersistenceHandle, PersistenceLayer};
use pulsemesh_node::proximity::{LoopbackProximityBackend, ProximityLayer};
use pulsemesh_node::security::{NodeSigner, ReputationHandle, ReputationManager};
use pulsemesh_node::telemetry::{Telemetry, TracingTelemetry};
use pulsemesh_node::transport::{TransportHandle, TransportLayer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub async fn start_transport(
    name: &str,
) -> (NodeId, TransportHandle, mpsc::Receiver<Message>, tempfile::TempDir) {
    let node_id = NodeId::generate();
    let dir = tempfile::tempdir().expect("tempdir");
    let signer: Arc<dyn Signer> = Arc::new(NodeSigner::new(&dir.path().join("signing.key")).expect("key init"));
    let consent: Arc<dyn Consent> = Arc::new(AlwaysGrantConsent);
    let codec = Arc::new(WireCodec::new());
    let keypair = libp2p::identity::Keypair::generate_ed25519();
    let telemetry: Arc<dyn Telemetry> = Arc::new(TracingTelemetry::new());
    let reputation = ReputationHandle::new(ReputationManager::new(dir.path().join("reputation.json")));
    let (transport, ingress) = TransportLayer::start(
        node_id.clone(),
        name.to_string(),
        keypair,
        codec,
        Some(signer),
        Some(consent),
        telemetry,
        Some(reputation),
    )
    .await
    .expect("transport starts");
    (node_id, transport, ingress, dir)
}

/// Wires a full federation node (transport + persistence + loopback proximity
/// + coordinator) with a fast broadcast cadence and proximity scanning
/// effectively disabled, suitable for the consensus/dream scenarios that
/// don't exercise proximity blending.
pub async fn start_federation<G: Generator + 'static>(
    name: &str,
    generator: G,
) -> (FederationHandle, NodeId, PersistenceHandle, tempfile::TempDir) {
    let (node_id, transport, ingress, dir) = start_transport(name).await;
    let persistence_signer: Arc<dyn Signer> =
        Arc::new(NodeSigner::new(&dir.path().join("persistence-signing.key")).expect("key init"));
    let persistence = PersistenceLayer::start(
        dir.path().to_path_buf(),
        node_id.clone(),
        name.to_string(),
        Some(persistence_signer),
        Some(Arc::new(AlwaysGrantConsent)),
    );
    let backend = Arc::new(LoopbackProximityBackend::new(-100.0));
    let proximity = Arc::new(ProximityLayer::new(backend, node_id.clone(), name.to_string()));

    let config = FederationConfig {
        local_node_id: node_id.clone(),
        local_node_name: name.to_string(),
        broadcast_interval: Duration::from_millis(300),
        advertise_interval: Duration::from_secs(3600),
        scan_interval: Duration::from_secs(3600),
        default_min_participants: 1,
        default_timeout: Duration::from_secs(5),
        default_method: ConsensusMethod::WeightedConfidence,
    };

    let local_emotion = EmotionalVector::from_scalars(EmotionalScalars::neutral());
    let telemetry: Arc<dyn Telemetry> = Arc::new(TracingTelemetry::new());
    let reputation = ReputationHandle::new(ReputationManager::new(dir.path().join("federation-reputation.json")));
    let federation = FederationNode::start(
        config,
        transport,
        ingress,
        persistence.clone(),
        proximity,
        generator,
        local_emotion,
        telemetry,
        Some(reputation),
    );
    (federation, node_id, persistence, dir)
}

/// Polls `snapshot()` until `peer` shows up in the peer table, or `timeout`
/// elapses. Peer table entries come from `STATE_BROADCAST`, so this also
/// doubles as "gossipsub mesh is up" confirmation.
pub async fn wait_for_peer(handle: &FederationHandle, peer: &NodeId, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(snapshot) = handle.snapshot().await {
            if snapshot.peer_table.contains_key(peer) {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Builds a minimal, already-consent-verified broadcast message. Tests that
/// want to force a specific `resonance_signature` overwrite it after the
/// fact, since `TransportHandle::send` only signs when the field is `None`.
pub fn make_message(sender_id: &NodeId, sender_name: &str, content: &str) -> Message {
    Message {
        message_id: MessageId::generate(),
        sender_id: sender_id.clone(),
        sender_name: sender_name.to_string(),
        receiver_id: None,
        layer: Layer::WifiMesh,
        intent: Intent::StateBroadcast,
        priority: Priority::Normal,
        content: content.to_string(),
        content_vector: None,
        emotional_vector: Some(EmotionalVector::from_scalars(EmotionalScalars::neutral())),
        resonance_signature: None,
        consent_verified: false,
        fold_id: None,
        scale_level: ScaleLevel("LOCAL".into()),
        fold_pattern: FoldPattern("NONE".into()),
        timestamp: 0.0,
        expiration: None,
        metadata: Default::default(),
    }
}
