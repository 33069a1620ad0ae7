//! `ProximityLayer` — short-range beacon advertise/scan (spec §4.4).
//!
//! BLE is not reachable from a portable rewrite, so the actual radio sits
//! behind a `ProximityBackend` trait: `UdpProximityBackend` broadcasts the
//! 32-byte beacon over a local UDP socket as the real default, and
//! `LoopbackProximityBackend` (in-process channel) is used by tests. This
//! substitution stands in for the teacher's physical-layer assumptions the
//! same way `qres_daemon`'s own P2P stack substitutes libp2p gossipsub for
//! whatever transport a given deployment actually has.

use async_trait::async_trait;
use blake3::hash;
use pulsemesh_core::fft::FftCodec;
use pulsemesh_core::ids::NodeId;
use pulsemesh_core::vector::{ContentVector, EmotionalScalars, EmotionalVector};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

pub const BEACON_LEN: usize = 32;
const EVICTION_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ProximityEvent {
    pub node_id: NodeId,
    pub name: String,
    pub emotional_vector: EmotionalVector,
    pub proximity: f64,
    pub last_seen: Instant,
}

/// A discovered raw beacon plus the signal strength the backend measured
/// for it. Backends that cannot measure RSSI report a fixed placeholder.
#[derive(Debug, Clone)]
pub struct DiscoveredBeacon {
    pub payload: [u8; BEACON_LEN],
    pub rssi: f64,
}

#[async_trait]
pub trait ProximityBackend: Send + Sync {
    async fn emit(&self, payload: [u8; BEACON_LEN]);
    async fn poll_discovered(&self) -> Vec<DiscoveredBeacon>;
}

/// Loopback backend for tests: every emitted beacon is immediately visible
/// to scan with a fixed RSSI.
pub struct LoopbackProximityBackend {
    inbox: Mutex<Vec<DiscoveredBeacon>>,
    fixed_rssi: f64,
}

impl LoopbackProximityBackend {
    pub fn new(fixed_rssi: f64) -> Self {
        Self {
            inbox: Mutex::new(Vec::new()),
            fixed_rssi,
        }
    }
}

#[async_trait]
impl ProximityBackend for LoopbackProximityBackend {
    async fn emit(&self, payload: [u8; BEACON_LEN]) {
        self.inbox.lock().await.push(DiscoveredBeacon {
            payload,
            rssi: self.fixed_rssi,
        });
    }

    async fn poll_discovered(&self) -> Vec<DiscoveredBeacon> {
        std::mem::take(&mut *self.inbox.lock().await)
    }
}

/// Real default: beacons are UDP broadcast datagrams on a well-known port.
/// No radio means no real RSSI; every received beacon reports a fixed
/// mid-range strength (documented limitation, recorded in DESIGN.md).
pub struct UdpProximityBackend {
    socket: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
    received: Mutex<mpsc::Receiver<DiscoveredBeacon>>,
}

const PLACEHOLDER_RSSI: f64 = -20.0;

impl UdpProximityBackend {
    pub async fn bind(port: u16, broadcast_addr: SocketAddr) -> anyhow::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        socket.set_broadcast(true)?;

        let (tx, rx) = mpsc::channel(64);
        let recv_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; BEACON_LEN];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((n, _addr)) if n == BEACON_LEN => {
                        let _ = tx
                            .send(DiscoveredBeacon {
                                payload: buf,
                                rssi: PLACEHOLDER_RSSI,
                            })
                            .await;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "proximity udp recv failed");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            socket,
            broadcast_addr,
            received: Mutex::new(rx),
        })
    }
}

#[async_trait]
impl ProximityBackend for UdpProximityBackend {
    async fn emit(&self, payload: [u8; BEACON_LEN]) {
        if let Err(e) = self.socket.send_to(&payload, self.broadcast_addr).await {
            warn!(error = %e, "failed to emit proximity beacon");
        }
    }

    async fn poll_discovered(&self) -> Vec<DiscoveredBeacon> {
        let mut out = Vec::new();
        let mut received = self.received.lock().await;
        while let Ok(beacon) = received.try_recv() {
            out.push(beacon);
        }
        out
    }
}

fn quantize_scalar(v: f64) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn dequantize_byte(b: u8) -> f64 {
    b as f64 / 255.0
}

/// Builds the 32-byte beacon: `[id_hash(8) | emotion_bytes(16) | sig_hash(8)]`.
pub fn encode_beacon(node_id: &NodeId, node_name: &str, scalars: &EmotionalScalars) -> [u8; BEACON_LEN] {
    let id_hash = hash(node_id.as_str().as_bytes());
    let mut id_hash_bytes = [0u8; 8];
    id_hash_bytes.copy_from_slice(&id_hash.as_bytes()[..8]);

    let mut emotion_bytes = [0u8; 16];
    for (i, v) in scalars.as_array().iter().enumerate() {
        emotion_bytes[i] = quantize_scalar(*v);
    }

    let mut sig_input = Vec::with_capacity(8 + 16 + node_name.len());
    sig_input.extend_from_slice(&id_hash_bytes);
    sig_input.extend_from_slice(&emotion_bytes);
    sig_input.extend_from_slice(node_name.as_bytes());
    let sig_hash = hash(&sig_input);
    let mut sig_hash_bytes = [0u8; 8];
    sig_hash_bytes.copy_from_slice(&sig_hash.as_bytes()[..8]);

    let mut beacon = [0u8; BEACON_LEN];
    beacon[0..8].copy_from_slice(&id_hash_bytes);
    beacon[8..24].copy_from_slice(&emotion_bytes);
    beacon[24..32].copy_from_slice(&sig_hash_bytes);
    beacon
}

struct DecodedBeacon {
    id_hash: [u8; 8],
    emotional_vector: EmotionalVector,
}

/// Reverses `encode_beacon`. The 16-byte emotion block is also fed through
/// `FftCodec::forward` to recover a harmonic field, per spec §4.4.
fn decode_beacon(payload: &[u8; BEACON_LEN], fft: &FftCodec) -> DecodedBeacon {
    let mut id_hash = [0u8; 8];
    id_hash.copy_from_slice(&payload[0..8]);

    let emotion_bytes = &payload[8..24];
    let mut arr = [0.0f64; 7];
    for (i, slot) in arr.iter_mut().enumerate() {
        *slot = dequantize_byte(emotion_bytes[i]);
    }
    let scalars = EmotionalScalars::from_array(arr);

    let harmonic_input: Vec<f64> = emotion_bytes.iter().map(|b| *b as f64).collect();
    let field = fft.forward(&ContentVector::new(harmonic_input));

    DecodedBeacon {
        id_hash,
        emotional_vector: EmotionalVector::with_harmonic_field(scalars, field),
    }
}

struct PeerEntry {
    name: String,
    last_seen: Instant,
}

pub struct ProximityLayer<B: ProximityBackend> {
    backend: Arc<B>,
    local_node_id: NodeId,
    local_node_name: String,
    fft: FftCodec,
    known: Mutex<HashMap<[u8; 8], PeerEntry>>,
}

impl<B: ProximityBackend> ProximityLayer<B> {
    pub fn new(backend: Arc<B>, local_node_id: NodeId, local_node_name: String) -> Self {
        Self {
            backend,
            local_node_id,
            local_node_name,
            fft: FftCodec::new(16),
            known: Mutex::new(HashMap::new()),
        }
    }

    pub async fn advertise(&self, scalars: &EmotionalScalars) {
        let beacon = encode_beacon(&self.local_node_id, &self.local_node_name, scalars);
        self.backend.emit(beacon).await;
    }

    /// Decodes discovered beacons into `ProximityEvent`s, evicting peers not
    /// seen for `EVICTION_AGE`. The layer never mutates federation state
    /// itself (spec §4.4) — it only raises events for the coordinator.
    pub async fn scan(&self) -> Vec<ProximityEvent> {
        let discovered = self.backend.poll_discovered().await;
        let mut events = Vec::with_capacity(discovered.len());
        let now = Instant::now();

        {
            let mut known = self.known.lock().await;
            for beacon in &discovered {
                let decoded = decode_beacon(&beacon.payload, &self.fft);
                let proximity = ((beacon.rssi + 40.0) / 60.0).clamp(0.0, 1.0);

                let name = known
                    .get(&decoded.id_hash)
                    .map(|e| e.name.clone())
                    .unwrap_or_else(|| hex::encode(decoded.id_hash));
                known.insert(
                    decoded.id_hash,
                    PeerEntry {
                        name: name.clone(),
                        last_seen: now,
                    },
                );

                events.push(ProximityEvent {
                    node_id: NodeId::from(hex::encode(decoded.id_hash)),
                    name,
                    emotional_vector: decoded.emotional_vector,
                    proximity,
                    last_seen: now,
                });
            }

            known.retain(|_, entry| now.duration_since(entry.last_seen) < EVICTION_AGE);
        }

        events
    }
}
