//! `FederationNode` — the coordinator (spec §4.6).
//!
//! Owns the three layers, the peer table, active consensus requests, and
//! the local emotional state, all mutated from a single task per the
//! inbox-funnel redesign (spec §9): callers post `Command`s over an `mpsc`
//! channel, the coordinator task is the sole mutator. Grounded on the
//! teacher's `swarm_p2p::{handle_broadcast_tick, handle_federation_tick,
//! handle_swarm_event}` `tokio::select!` loop, generalized from brain-gossip
//! fan-out to request/response consensus correlation.

use pulsemesh_core::consensus::{self, AdaptiveEnsembleState, ConsensusMethod, ConsensusResult, Response};
use pulsemesh_core::ids::{NodeId, RequestId};
use pulsemesh_core::vector::EmotionalVector;
use pulsemesh_core::wire::{Intent, Layer, Message, Priority};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{info, warn};

use crate::persistence::{PersistenceHandle, Record, RecordKind};
use crate::proximity::{ProximityBackend, ProximityLayer};
use crate::security::ReputationHandle;
use crate::telemetry::Telemetry;
use crate::transport::TransportHandle;

const COORDINATOR_TICK: Duration = Duration::from_millis(200);
const PENDING_REQUEST_GRACE: Duration = Duration::from_secs(1);
const PEER_TTL: Duration = Duration::from_secs(30);
const PROXIMITY_PUSH_CAP: f64 = 0.3;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("generator backend failed: {0}")]
    Failed(String),
}

/// External port producing per-node textual responses; the actual model
/// backend is out of scope (spec §1's non-goal on rendering/remote admin
/// covers the generative back-end itself, not this seam).
pub trait Generator: Send + Sync {
    fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        history: &[String],
    ) -> Result<Response, GeneratorError>;
}

/// Deterministic reference implementation: echoes the prompt back with a
/// fixed confidence/resonance, useful for wiring tests without a real
/// model backend.
pub struct EchoGenerator {
    pub model_id: String,
}

impl Generator for EchoGenerator {
    fn generate(&self, prompt: &str, _system: Option<&str>, _history: &[String]) -> Result<Response, GeneratorError> {
        Ok(Response {
            content: prompt.to_string(),
            model_id: self.model_id.clone(),
            confidence: 0.7,
            resonance: 0.7,
            consent_verified: true,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NodeState {
    pub node_id: NodeId,
    pub name: String,
    pub emotional_vector: Option<EmotionalVector>,
    pub last_update: Instant,
}

struct PendingRequest {
    prompt: String,
    method: ConsensusMethod,
    responses: BTreeMap<NodeId, Response>,
    deadline: Instant,
    min_participants: usize,
    reply: Option<oneshot::Sender<ConsensusResult>>,
    started_at: Instant,
}

pub struct RequestConsensusArgs {
    pub prompt: String,
    pub system: Option<String>,
    pub history: Vec<String>,
    pub min_participants: usize,
    pub timeout: Duration,
    pub method: ConsensusMethod,
}

enum Command {
    RequestConsensus {
        args: RequestConsensusArgs,
        reply: oneshot::Sender<Result<ConsensusResult, GeneratorError>>,
    },
    StoreDream {
        content: String,
        tags: Vec<String>,
        reply: oneshot::Sender<Result<Record, crate::persistence::PersistenceError>>,
    },
    Snapshot {
        reply: oneshot::Sender<CoordinatorSnapshot>,
    },
    Shutdown,
}

/// A point-in-time read of coordinator state, for status endpoints and
/// tests — never mutated from outside the coordinator task (spec §5).
#[derive(Debug, Clone)]
pub struct CoordinatorSnapshot {
    pub peer_table: HashMap<NodeId, NodeState>,
    pub local_emotion: EmotionalVector,
    pub active_requests: usize,
}

#[derive(Clone)]
pub struct FederationHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl FederationHandle {
    pub async fn request_consensus(&self, args: RequestConsensusArgs) -> Result<ConsensusResult, GeneratorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::RequestConsensus { args, reply: reply_tx }).await.is_err() {
            return Err(GeneratorError::Failed("federation coordinator has shut down".into()));
        }
        reply_rx.await.unwrap_or_else(|_| Err(GeneratorError::Failed("coordinator dropped the reply channel".into())))
    }

    pub async fn store_dream(
        &self,
        content: String,
        tags: Vec<String>,
    ) -> Result<Record, crate::persistence::PersistenceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::StoreDream { content, tags, reply: reply_tx })
            .await
            .map_err(|_| crate::persistence::PersistenceError::WorkerGone)?;
        reply_rx.await.map_err(|_| crate::persistence::PersistenceError::WorkerGone)?
    }

    pub async fn snapshot(&self) -> Option<CoordinatorSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx.send(Command::Snapshot { reply: reply_tx }).await.ok()?;
        reply_rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

pub struct FederationConfig {
    pub local_node_id: NodeId,
    pub local_node_name: String,
    pub broadcast_interval: Duration,
    pub advertise_interval: Duration,
    pub scan_interval: Duration,
    pub default_min_participants: usize,
    pub default_timeout: Duration,
    pub default_method: ConsensusMethod,
}

struct Coordinator<G: Generator, B: ProximityBackend> {
    config: FederationConfig,
    transport: TransportHandle,
    persistence: PersistenceHandle,
    proximity: Arc<ProximityLayer<B>>,
    generator: G,
    peer_table: HashMap<NodeId, NodeState>,
    active: HashMap<RequestId, PendingRequest>,
    local_emotion: EmotionalVector,
    adaptive_state: AdaptiveEnsembleState,
    last_broadcast: Instant,
    last_advertise: Instant,
    last_scan: Instant,
    telemetry: Arc<dyn Telemetry>,
    reputation: Option<ReputationHandle>,
}

impl<G: Generator, B: ProximityBackend> Coordinator<G, B> {
    fn new(
        config: FederationConfig,
        transport: TransportHandle,
        persistence: PersistenceHandle,
        proximity: Arc<ProximityLayer<B>>,
        generator: G,
        local_emotion: EmotionalVector,
        telemetry: Arc<dyn Telemetry>,
        reputation: Option<ReputationHandle>,
    ) -> Self {
        let now = Instant::now();
        Self {
            config,
            transport,
            persistence,
            proximity,
            generator,
            peer_table: HashMap::new(),
            active: HashMap::new(),
            local_emotion,
            adaptive_state: AdaptiveEnsembleState::default(),
            last_broadcast: now,
            last_advertise: now,
            last_scan: now,
            telemetry,
            reputation,
        }
    }

    fn broadcast_message(&self, intent: Intent, content: String, metadata: serde_json::Map<String, serde_json::Value>) -> Message {
        Message {
            message_id: pulsemesh_core::ids::MessageId::generate(),
            sender_id: self.config.local_node_id.clone(),
            sender_name: self.config.local_node_name.clone(),
            receiver_id: None,
            layer: Layer::WifiMesh,
            intent,
            priority: Priority::Normal,
            content,
            content_vector: None,
            emotional_vector: Some(self.local_emotion.clone()),
            resonance_signature: None,
            consent_verified: false,
            fold_id: None,
            scale_level: pulsemesh_core::wire::ScaleLevel("LOCAL".into()),
            fold_pattern: pulsemesh_core::wire::FoldPattern("NONE".into()),
            timestamp: now_secs(),
            expiration: None,
            metadata,
        }
    }

    async fn handle_request_consensus(
        &mut self,
        args: RequestConsensusArgs,
        reply: oneshot::Sender<Result<ConsensusResult, GeneratorError>>,
    ) {
        let local_response = match self.generator.generate(&args.prompt, args.system.as_deref(), &args.history) {
            Ok(r) => r,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let request_id = RequestId::generate();
        let mut responses = BTreeMap::new();
        responses.insert(self.config.local_node_id.clone(), local_response.clone());

        let mut metadata = serde_json::Map::new();
        metadata.insert("request_id".into(), serde_json::Value::String(request_id.to_string()));
        metadata.insert("method".into(), serde_json::to_value(args.method).unwrap());
        metadata.insert("prompt".into(), serde_json::Value::String(args.prompt.clone()));

        let broadcast = self.broadcast_message(Intent::ConsensusRequest, args.prompt.clone(), metadata);
        if let Err(e) = self.transport.send(broadcast).await {
            warn!(error = %e, "failed to broadcast consensus request");
        }

        self.active.insert(
            request_id,
            PendingRequest {
                prompt: args.prompt,
                method: args.method,
                responses,
                deadline: Instant::now() + args.timeout,
                min_participants: args.min_participants,
                reply: Some(reply),
                started_at: Instant::now(),
            },
        );
    }

    fn resolve_due_requests(&mut self) {
        let now = Instant::now();
        let due: Vec<RequestId> = self
            .active
            .iter()
            .filter(|(_, pending)| pending.responses.len() >= pending.min_participants || now >= pending.deadline)
            .map(|(id, _)| id.clone())
            .collect();

        for request_id in due {
            if let Some(mut pending) = self.active.remove(&request_id) {
                let distributed = pending.responses.len() > 1;
                let result = if distributed {
                    let node_count = pending.responses.len();
                    let mut result = consensus::reduce(
                        pending.method,
                        &pending.responses,
                        &pending.prompt,
                        Some(&mut self.adaptive_state),
                    );
                    result.metadata.insert("distributed".into(), serde_json::Value::Bool(true));
                    result.metadata.insert("node_count".into(), serde_json::Value::Number(node_count.into()));
                    result
                } else {
                    let local = pending
                        .responses
                        .values()
                        .next()
                        .cloned()
                        .expect("a pending request always seeds its own local response");
                    ConsensusResult {
                        content: local.content,
                        selected: consensus::Selected::Node(self.config.local_node_id.clone()),
                        confidence: local.confidence,
                        resonance: local.resonance,
                        metadata: {
                            let mut m = serde_json::Map::new();
                            m.insert("distributed".into(), serde_json::Value::Bool(false));
                            m.insert("node_count".into(), serde_json::Value::Number(1.into()));
                            m
                        },
                    }
                };

                self.telemetry.record_consensus_latency(
                    &format!("{:?}", pending.method),
                    pending.started_at.elapsed(),
                );

                if let Some(reply) = pending.reply.take() {
                    let _ = reply.send(Ok(result));
                }
            }
        }

        // Hard eviction for anything lingering past deadline + grace, bounding
        // memory even if a caller already dropped its reply channel.
        self.active.retain(|_, pending| now < pending.deadline + PENDING_REQUEST_GRACE);
    }

    async fn handle_ingress(&mut self, message: Message) {
        match message.intent {
            Intent::StateBroadcast => {
                self.peer_table.insert(
                    message.sender_id.clone(),
                    NodeState {
                        node_id: message.sender_id.clone(),
                        name: message.sender_name.clone(),
                        emotional_vector: message.emotional_vector.clone(),
                        last_update: Instant::now(),
                    },
                );
            }
            Intent::ConsensusRequest => {
                let request_id = message
                    .metadata
                    .get("request_id")
                    .and_then(|v| v.as_str())
                    .map(RequestId::from);
                let Some(request_id) = request_id else {
                    warn!("dropping consensus request without a request_id");
                    return;
                };
                if self.active.contains_key(&request_id) {
                    return;
                }
                match self.generator.generate(&message.content, None, &[]) {
                    Ok(response) => {
                        let mut metadata = serde_json::Map::new();
                        metadata.insert("request_id".into(), serde_json::Value::String(request_id.to_string()));
                        metadata.insert("model_id".into(), serde_json::Value::String(response.model_id.clone()));
                        metadata.insert("confidence".into(), serde_json::json!(response.confidence));
                        metadata.insert("resonance".into(), serde_json::json!(response.resonance));
                        metadata.insert("consent_verified".into(), serde_json::Value::Bool(response.consent_verified));

                        let mut reply_msg = self.broadcast_message(Intent::ConsensusResponse, response.content, metadata);
                        reply_msg.receiver_id = Some(message.sender_id);
                        if let Err(e) = self.transport.send(reply_msg).await {
                            warn!(error = %e, "failed to send consensus response");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "generator failed for remote consensus request, requester will time out");
                    }
                }
            }
            Intent::ConsensusResponse => {
                let request_id = message
                    .metadata
                    .get("request_id")
                    .and_then(|v| v.as_str())
                    .map(RequestId::from);
                let Some(request_id) = request_id else { return };
                if let Some(pending) = self.active.get_mut(&request_id) {
                    let response = Response {
                        content: message.content,
                        model_id: message
                            .metadata
                            .get("model_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        confidence: message.metadata.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.0),
                        resonance: message.metadata.get("resonance").and_then(|v| v.as_f64()).unwrap_or(0.0),
                        consent_verified: message
                            .metadata
                            .get("consent_verified")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false),
                    };
                    if let Some(reputation) = &self.reputation {
                        reputation.reward(&message.sender_id.to_string());
                    }
                    pending.responses.insert(message.sender_id, response);
                }
            }
            Intent::DreamSharing => {
                let record = Record {
                    record_id: pulsemesh_core::ids::RecordId::generate(),
                    author_node_id: message.sender_id,
                    author_name: message.sender_name,
                    kind: RecordKind::Dream,
                    content: message.content,
                    content_vector: message.content_vector,
                    emotional_vector: message.emotional_vector,
                    signature: message.resonance_signature,
                    consent_level: if message.consent_verified { 5 } else { 1 },
                    lineage: Vec::new(),
                    scale_level: message.scale_level.0,
                    fold_pattern: message.fold_pattern.0,
                    tags: vec!["dream".into(), "shared".into()],
                    created_at: now_secs(),
                    modified_at: now_secs(),
                    location: None,
                    metadata: {
                        let mut m = serde_json::Map::new();
                        m.insert("shared".into(), serde_json::Value::Bool(true));
                        m
                    },
                };
                if let Err(e) = self.persistence.store(record).await {
                    warn!(error = %e, "failed to persist shared dream");
                }
            }
            other => {
                info!(intent = ?other, "ignoring unhandled intent");
            }
        }
    }

    async fn tick(&mut self) {
        let now = Instant::now();

        if now.duration_since(self.last_broadcast) >= self.config.broadcast_interval {
            self.last_broadcast = now;
            let state_msg = self.broadcast_message(Intent::StateBroadcast, String::new(), serde_json::Map::new());
            if let Err(e) = self.transport.send(state_msg).await {
                warn!(error = %e, "failed to send periodic state broadcast");
            }
        }

        if now.duration_since(self.last_advertise) >= self.config.advertise_interval {
            self.last_advertise = now;
            self.proximity.advertise(self.local_emotion.scalars()).await;
        }

        if now.duration_since(self.last_scan) >= self.config.scan_interval {
            self.last_scan = now;
            for event in self.proximity.scan().await {
                if event.proximity > 0.3 {
                    let w = (0.3 * event.proximity).min(PROXIMITY_PUSH_CAP);
                    self.local_emotion = self.local_emotion.blend(&event.emotional_vector, w);
                }
            }
        }

        self.peer_table.retain(|_, peer| now.duration_since(peer.last_update) < PEER_TTL);
        self.resolve_due_requests();
    }

    async fn handle_store_dream(&self, content: String, tags: Vec<String>) -> Result<Record, crate::persistence::PersistenceError> {
        let record = self
            .persistence
            .store_dream(content.clone(), Some(self.local_emotion.clone()), tags)
            .await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("record_id".into(), serde_json::Value::String(record.record_id.to_string()));
        let dream_msg = self.broadcast_message(Intent::DreamSharing, content, metadata);
        if let Err(e) = self.transport.send(dream_msg).await {
            warn!(error = %e, "failed to broadcast dream");
        }
        Ok(record)
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub struct FederationNode;

impl FederationNode {
    pub fn start<G: Generator + 'static, B: ProximityBackend + 'static>(
        config: FederationConfig,
        transport: TransportHandle,
        ingress: mpsc::Receiver<Message>,
        persistence: PersistenceHandle,
        proximity: Arc<ProximityLayer<B>>,
        generator: G,
        local_emotion: EmotionalVector,
        telemetry: Arc<dyn Telemetry>,
        reputation: Option<ReputationHandle>,
    ) -> FederationHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(64);
        let coordinator = Coordinator::new(
            config,
            transport,
            persistence,
            proximity,
            generator,
            local_emotion,
            telemetry,
            reputation,
        );
        tokio::spawn(run_coordinator(coordinator, cmd_rx, ingress));
        FederationHandle { cmd_tx }
    }
}

async fn run_coordinator<G: Generator, B: ProximityBackend>(
    mut coordinator: Coordinator<G, B>,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut ingress: mpsc::Receiver<Message>,
) {
    let mut ticker = interval(COORDINATOR_TICK);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                coordinator.tick().await;
            }
            Some(message) = ingress.recv() => {
                coordinator.handle_ingress(message).await;
            }
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    Command::RequestConsensus { args, reply } => {
                        coordinator.handle_request_consensus(args, reply).await;
                    }
                    Command::StoreDream { content, tags, reply } => {
                        let _ = reply.send(coordinator.handle_store_dream(content, tags).await);
                    }
                    Command::Snapshot { reply } => {
                        let _ = reply.send(CoordinatorSnapshot {
                            peer_table: coordinator.peer_table.clone(),
                            local_emotion: coordinator.local_emotion.clone(),
                            active_requests: coordinator.active.len(),
                        });
                    }
                    Command::Shutdown => break,
                }
            }
            else => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedGenerator;
    impl Generator for FixedGenerator {
        fn generate(&self, prompt: &str, _system: Option<&str>, _history: &[String]) -> Result<Response, GeneratorError> {
            Ok(Response {
                content: prompt.to_string(),
                model_id: "fixed".into(),
                confidence: 0.9,
                resonance: 0.9,
                consent_verified: true,
            })
        }
    }

    #[test]
    fn echo_generator_returns_prompt_as_content() {
        let gen = EchoGenerator { model_id: "echo".into() };
        let response = gen.generate("hello", None, &[]).unwrap();
        assert_eq!(response.content, "hello");
    }

    #[test]
    fn fixed_generator_is_deterministic() {
        let gen = FixedGenerator;
        let a = gen.generate("p", None, &[]).unwrap();
        let b = gen.generate("p", None, &[]).unwrap();
        assert_eq!(a.content, b.content);
        assert_eq!(a.confidence, b.confidence);
    }
}
