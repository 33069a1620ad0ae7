//! `TransportLayer` (spec §4.3): one libp2p gossipsub swarm per node, a
//! bounded egress queue drained by a single sender task, and a UDP
//! broadcast fallback for when no broker is reachable.
//!
//! Grounded on the teacher's `swarm_p2p.rs`: the `QresBehavior` combined
//! behaviour (gossipsub + mdns + identify), `build_swarm`'s
//! `SwarmBuilder::with_existing_identity().with_tokio().with_tcp(...)`
//! chain, and its `tokio::select!` event loop — generalized from a single
//! hardcoded brain-sync topic to the spec's `broadcast` / `nodes/<id>` topic
//! discipline and from ML payloads to `pulsemesh_core::Message`.

use pulsemesh_core::consent::{Consent, ConsentContext};
use pulsemesh_core::fft::FftCodec;
use pulsemesh_core::ids::NodeId;
use pulsemesh_core::signer::Signer;
use pulsemesh_core::vector::{EmotionalScalars, EmotionalVector};
use pulsemesh_core::wire::{Intent, Message, WireCodec};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::security::ReputationHandle;
use crate::telemetry::{DropReason, Telemetry};

use libp2p::{
    futures::StreamExt,
    gossipsub, identify, mdns, noise,
    swarm::{NetworkBehaviour, SwarmEvent},
    tcp, yamux, PeerId, Swarm, SwarmBuilder,
};

const GOSSIPSUB_HEARTBEAT_SECS: u64 = 1;
const RING_BUFFER_CAPACITY: usize = 100;
const DEDUP_WINDOW_CAPACITY: usize = 2048;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable")]
    TransportUnavailable,
    #[error("consent denied for this send")]
    ConsentDenied,
    #[error("failed to encode message: {0}")]
    Encode(#[from] pulsemesh_core::wire::WireError),
}

#[derive(Clone, Debug)]
pub struct RingEntry {
    pub message_id: String,
    pub sender_id: String,
    pub intent: Intent,
    pub timestamp: f64,
}

#[derive(NetworkBehaviour)]
struct PulseMeshBehaviour {
    gossipsub: gossipsub::Behaviour,
    mdns: mdns::tokio::Behaviour,
    identify: identify::Behaviour,
}

fn broadcast_topic() -> gossipsub::IdentTopic {
    gossipsub::IdentTopic::new("broadcast")
}

fn node_topic(node_id: &NodeId) -> gossipsub::IdentTopic {
    gossipsub::IdentTopic::new(format!("nodes/{node_id}"))
}

struct RingBuffers {
    sent: VecDeque<RingEntry>,
    received: VecDeque<RingEntry>,
}

impl RingBuffers {
    fn new() -> Self {
        Self {
            sent: VecDeque::with_capacity(RING_BUFFER_CAPACITY),
            received: VecDeque::with_capacity(RING_BUFFER_CAPACITY),
        }
    }

    fn push_sent(&mut self, entry: RingEntry) {
        if self.sent.len() >= RING_BUFFER_CAPACITY {
            self.sent.pop_front();
        }
        self.sent.push_back(entry);
    }

    fn push_received(&mut self, entry: RingEntry) {
        if self.received.len() >= RING_BUFFER_CAPACITY {
            self.received.pop_front();
        }
        self.received.push_back(entry);
    }
}

/// Bounded window of recently seen `message_id`s, used to deduplicate
/// ingress (spec §3: "deduplicate by message_id within a bounded window").
struct DedupWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupWindow {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn check_and_insert(&mut self, message_id: &str) -> bool {
        if self.seen.contains(message_id) {
            return true;
        }
        if self.order.len() >= DEDUP_WINDOW_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(message_id.to_string());
        self.order.push_back(message_id.to_string());
        false
    }
}

/// Handle the coordinator holds; cloneable, cheap. Send never blocks on
/// network I/O — it only enqueues onto the bounded egress channel the
/// sender task drains.
#[derive(Clone)]
pub struct TransportHandle {
    local_node_id: NodeId,
    local_node_name: String,
    egress_tx: mpsc::Sender<Message>,
    codec: Arc<WireCodec>,
    signer: Option<Arc<dyn Signer>>,
    consent: Option<Arc<dyn Consent>>,
    fft: Arc<FftCodec>,
    rings: Arc<Mutex<RingBuffers>>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl TransportHandle {
    /// Runs the egress pipeline (spec §4.3 steps 1-4) and enqueues the
    /// encoded message for the sender task.
    pub async fn send(&self, mut message: Message) -> Result<(), TransportError> {
        if self.closed.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(TransportError::TransportUnavailable);
        }

        if message.sender_id.as_str().is_empty() {
            message.sender_id = self.local_node_id.clone();
        }
        if message.sender_name.is_empty() {
            message.sender_name = self.local_node_name.clone();
        }

        if message.content_vector.is_none() && !message.content.is_empty() {
            message.content_vector = Some(self.fft.embed_text(&message.content));
        }

        if message.resonance_signature.is_none() {
            if let Some(signer) = &self.signer {
                let emotion = message
                    .emotional_vector
                    .clone()
                    .unwrap_or_else(|| EmotionalVector::from_scalars(EmotionalScalars::neutral()));
                message.resonance_signature = Some(signer.sign(
                    &message.sender_id,
                    &emotion,
                    &message.scale_level.0,
                ));
            }
        }

        if !message.consent_verified {
            if let Some(consent) = &self.consent {
                let vector = message
                    .content_vector
                    .clone()
                    .unwrap_or_else(|| pulsemesh_core::vector::ContentVector::new(Vec::new()));
                let context = ConsentContext {
                    scale_level: message.scale_level.0.clone(),
                    fold_pattern: message.fold_pattern.0.clone(),
                };
                let result = consent.verify(&vector, &context);
                message.consent_verified = result.granted;
                if !result.granted {
                    return Err(TransportError::ConsentDenied);
                }
            }
        }

        {
            let mut rings = self.rings.lock().expect("ring buffer mutex poisoned");
            rings.push_sent(RingEntry {
                message_id: message.message_id.to_string(),
                sender_id: message.sender_id.to_string(),
                intent: message.intent,
                timestamp: message.timestamp,
            });
        }

        self.egress_tx
            .try_send(message)
            .map_err(|_| TransportError::TransportUnavailable)
    }

    pub fn snapshot_sent(&self) -> Vec<RingEntry> {
        self.rings.lock().expect("ring buffer mutex poisoned").sent.iter().cloned().collect()
    }

    pub fn snapshot_received(&self) -> Vec<RingEntry> {
        self.rings
            .lock()
            .expect("ring buffer mutex poisoned")
            .received
            .iter()
            .cloned()
            .collect()
    }
}

pub struct TransportLayer;

impl TransportLayer {
    /// Starts the libp2p-backed transport: spawns one task owning the
    /// swarm, returns a cloneable `TransportHandle` for egress and an
    /// `mpsc::Receiver<Message>` of validated ingress messages.
    pub async fn start(
        local_node_id: NodeId,
        local_node_name: String,
        keypair: libp2p::identity::Keypair,
        codec: Arc<WireCodec>,
        signer: Option<Arc<dyn Signer>>,
        consent: Option<Arc<dyn Consent>>,
        telemetry: Arc<dyn Telemetry>,
        reputation: Option<ReputationHandle>,
    ) -> anyhow::Result<(TransportHandle, mpsc::Receiver<Message>)> {
        let mut swarm = build_swarm(keypair)?;
        swarm.behaviour_mut().gossipsub.subscribe(&broadcast_topic())?;
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&node_topic(&local_node_id))?;
        swarm.listen_on("/ip4/0.0.0.0/tcp/0".parse()?)?;

        let (egress_tx, mut egress_rx) = mpsc::channel::<Message>(256);
        let (ingress_tx, ingress_rx) = mpsc::channel::<Message>(256);

        let rings = Arc::new(Mutex::new(RingBuffers::new()));
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let handle = TransportHandle {
            local_node_id: local_node_id.clone(),
            local_node_name,
            egress_tx,
            codec: codec.clone(),
            signer: signer.clone(),
            consent,
            fft: Arc::new(FftCodec::new(pulsemesh_core::vector::DEFAULT_DIMENSION)),
            rings: rings.clone(),
            closed: closed.clone(),
        };

        tokio::spawn(async move {
            let mut dedup = DedupWindow::new();
            loop {
                tokio::select! {
                    Some(message) = egress_rx.recv() => {
                        match codec.encode(&message) {
                            Ok(payload) => {
                                let topic = match &message.receiver_id {
                                    Some(id) => node_topic(id),
                                    None => broadcast_topic(),
                                };
                                if let Err(e) = swarm
                                    .behaviour_mut()
                                    .gossipsub
                                    .publish(topic, payload.into_bytes())
                                {
                                    warn!(error = %e, "gossipsub publish failed");
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to encode outgoing message"),
                        }
                    }
                    event = swarm.select_next_some() => {
                        handle_swarm_event(
                            event,
                            &codec,
                            &signer,
                            &local_node_id,
                            &mut dedup,
                            &rings,
                            &ingress_tx,
                            telemetry.as_ref(),
                            reputation.as_ref(),
                        ).await;
                    }
                    else => break,
                }
            }
            closed.store(true, std::sync::atomic::Ordering::Relaxed);
        });

        Ok((handle, ingress_rx))
    }
}

fn build_swarm(keypair: libp2p::identity::Keypair) -> anyhow::Result<Swarm<PulseMeshBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
        .with_behaviour(|key| {
            let message_id_fn = |message: &gossipsub::Message| {
                let mut hasher = DefaultHasher::new();
                message.data.hash(&mut hasher);
                gossipsub::MessageId::from(hasher.finish().to_string())
            };
            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(GOSSIPSUB_HEARTBEAT_SECS))
                .validation_mode(gossipsub::ValidationMode::Permissive)
                .message_id_fn(message_id_fn)
                .build()
                .map_err(io::Error::other)?;

            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )
            .map_err(io::Error::other)?;

            let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), PeerId::from(key.public()))?;
            let identify = identify::Behaviour::new(identify::Config::new(
                "pulsemesh/1.0.0".to_string(),
                key.public(),
            ));

            Ok(PulseMeshBehaviour {
                gossipsub,
                mdns,
                identify,
            })
        })?
        .build();
    Ok(swarm)
}

async fn handle_swarm_event(
    event: SwarmEvent<PulseMeshBehaviourEvent>,
    codec: &WireCodec,
    signer: &Option<Arc<dyn Signer>>,
    local_node_id: &NodeId,
    dedup: &mut DedupWindow,
    rings: &Arc<Mutex<RingBuffers>>,
    ingress_tx: &mpsc::Sender<Message>,
    telemetry: &dyn Telemetry,
    reputation: Option<&ReputationHandle>,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            info!(%address, "listening");
        }
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            info!(%peer_id, "connection established");
        }
        SwarmEvent::ConnectionClosed { peer_id, .. } => {
            info!(%peer_id, "connection closed");
        }
        SwarmEvent::Behaviour(PulseMeshBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
            for (peer_id, _addr) in list {
                info!(%peer_id, "discovered via mdns");
            }
        }
        SwarmEvent::Behaviour(PulseMeshBehaviourEvent::Mdns(mdns::Event::Expired(list))) => {
            for (peer_id, _addr) in list {
                info!(%peer_id, "mdns entry expired");
            }
        }
        SwarmEvent::Behaviour(PulseMeshBehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            info!(%peer_id, protocol = %info.protocol_version, "identify received");
        }
        SwarmEvent::Behaviour(PulseMeshBehaviourEvent::Gossipsub(gossipsub::Event::Message {
            message, ..
        })) => {
            handle_ingress_payload(
                &message.data,
                codec,
                signer,
                local_node_id,
                dedup,
                rings,
                ingress_tx,
                telemetry,
                reputation,
            )
            .await;
        }
        _ => {}
    }
}

/// Ingress pipeline (spec §4.3 steps 1-4; steps 5-6 are the federation
/// coordinator's job once it receives the validated message).
async fn handle_ingress_payload(
    data: &[u8],
    codec: &WireCodec,
    signer: &Option<Arc<dyn Signer>>,
    local_node_id: &NodeId,
    dedup: &mut DedupWindow,
    rings: &Arc<Mutex<RingBuffers>>,
    ingress_tx: &mpsc::Sender<Message>,
    telemetry: &dyn Telemetry,
    reputation: Option<&ReputationHandle>,
) {
    let payload = match std::str::from_utf8(data) {
        Ok(s) => s,
        Err(_) => {
            telemetry.record_drop(DropReason::InvalidUtf8);
            return;
        }
    };
    let message = match codec.decode(payload) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "dropping malformed ingress message");
            telemetry.record_drop(DropReason::Malformed);
            return;
        }
    };

    if message.is_self_addressed_drop(local_node_id) {
        telemetry.record_drop(DropReason::SelfAddressed);
        return;
    }

    if dedup.check_and_insert(message.message_id.as_str()) {
        telemetry.record_drop(DropReason::Duplicate);
        return;
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    if message.is_expired(now) {
        telemetry.record_drop(DropReason::Expired);
        return;
    }

    if let Some(signature) = &message.resonance_signature {
        if let Some(signer) = signer {
            let (ok, _score) = signer.verify(signature, &message.scale_level.0);
            if !ok {
                warn!(message_id = %message.message_id, "dropping message with invalid signature");
                telemetry.record_drop(DropReason::InvalidSignature);
                if let Some(reputation) = reputation {
                    reputation.punish(&message.sender_id.to_string());
                }
                return;
            }
        }
    }

    {
        let mut rings = rings.lock().expect("ring buffer mutex poisoned");
        rings.push_received(RingEntry {
            message_id: message.message_id.to_string(),
            sender_id: message.sender_id.to_string(),
            intent: message.intent,
            timestamp: message.timestamp,
        });
    }

    let _ = ingress_tx.try_send(message);
}

/// UDP broadcast fallback (spec §4.3): used when the primary gossipsub
/// backend is configured as unavailable. Single shared broadcast
/// address/port; multi-subnet behaviour is explicitly undefined (spec §9
/// Open Questions).
pub struct UdpBackend {
    socket: UdpSocket,
    broadcast_addr: std::net::SocketAddr,
}

impl UdpBackend {
    pub async fn bind(port: u16, broadcast_addr: std::net::SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        socket.set_broadcast(true)?;
        Ok(Self { socket, broadcast_addr })
    }

    /// Frames as `topic|payload`, matching spec §4.3's documented fallback
    /// framing.
    pub async fn send(&self, topic: &str, payload: &str) -> anyhow::Result<()> {
        let frame = format!("{topic}|{payload}");
        self.socket.send_to(frame.as_bytes(), self.broadcast_addr).await?;
        Ok(())
    }

    pub async fn recv(&self) -> anyhow::Result<(String, String)> {
        let mut buf = vec![0u8; 65536];
        let (n, _addr) = self.socket.recv_from(&mut buf).await?;
        let frame = String::from_utf8_lossy(&buf[..n]).to_string();
        match frame.split_once('|') {
            Some((topic, payload)) => Ok((topic.to_string(), payload.to_string())),
            None => anyhow::bail!("malformed udp frame, missing topic separator"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_window_detects_repeats() {
        let mut dedup = DedupWindow::new();
        assert!(!dedup.check_and_insert("m1"));
        assert!(dedup.check_and_insert("m1"));
    }

    #[test]
    fn ring_buffers_cap_at_capacity() {
        let mut rings = RingBuffers::new();
        for i in 0..(RING_BUFFER_CAPACITY + 10) {
            rings.push_sent(RingEntry {
                message_id: i.to_string(),
                sender_id: "a".into(),
                intent: Intent::StateBroadcast,
                timestamp: 0.0,
            });
        }
        assert_eq!(rings.sent.len(), RING_BUFFER_CAPACITY);
    }
}
