//! Concrete `Signer` wiring plus peer reputation tracking.
//!
//! `NodeSigner` is the production implementation of `pulsemesh_core::Signer`
//! for this daemon: an ed25519 key loaded from (or generated into) a key
//! file, with a self-contained signed envelope so `verify` needs nothing
//! beyond the `Signature` and the claimed scale — directly grounded on the
//! teacher's `SecurityManager`/`SignedPayload` (same envelope shape: data,
//! timestamp, nonce, hex signature, hex pubkey; same replay defenses).
//!
//! `ReputationManager` tracks peer trust as a supplemented feature (spec.md
//! is silent on reputation; the teacher's daemon carries one, and nothing in
//! the federation coordinator contradicts having it) — kept close to
//! verbatim from the teacher.

use ed25519_dalek::{Signature as DalekSignature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use pulsemesh_core::ids::NodeId;
use pulsemesh_core::signer::{Signature, Signer};
use pulsemesh_core::vector::EmotionalVector;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("message expired")]
    ExpiredMessage,
    #[error("future timestamp detected")]
    FutureTimestamp,
    #[error("replay detected")]
    ReplayDetected,
    #[error("scale mismatch")]
    ScaleMismatch,
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("failed to read or write key file: {0}")]
    KeyIo(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    identity: String,
    scale: String,
    scalars: [f64; 7],
    timestamp: u64,
    nonce: u64,
    pubkey: String,
    sig: String,
}

impl Envelope {
    fn signed_bytes(&self) -> Vec<u8> {
        let mut buf = self.identity.as_bytes().to_vec();
        buf.extend_from_slice(self.scale.as_bytes());
        for s in self.scalars {
            buf.extend_from_slice(&s.to_le_bytes());
        }
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf
    }
}

pub struct NodeSigner {
    signing_key: SigningKey,
    seen_nonces: Mutex<HashSet<u64>>,
    max_message_age_secs: u64,
}

impl NodeSigner {
    /// Loads the signing key from `key_path`, generating and persisting a
    /// fresh one if absent.
    pub fn new(key_path: &Path) -> Result<Self, SecurityError> {
        let signing_key = if key_path.exists() {
            let key_bytes = fs::read(key_path)?;
            if key_bytes.len() != 32 {
                return Err(SecurityError::MalformedEnvelope("key file is not 32 bytes".into()));
            }
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&key_bytes);
            SigningKey::from_bytes(&arr)
        } else {
            let mut csprng = OsRng;
            let key = SigningKey::generate(&mut csprng);
            if let Some(parent) = key_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(key_path, key.to_bytes())?;
            key
        };

        Ok(Self {
            signing_key,
            seen_nonces: Mutex::new(HashSet::new()),
            max_message_age_secs: 300,
        })
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    fn now_secs() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock is after the unix epoch")
            .as_secs()
    }
}

impl Signer for NodeSigner {
    fn sign(&self, identity: &NodeId, emotion: &EmotionalVector, scale: &str) -> Signature {
        let mut envelope = Envelope {
            identity: identity.to_string(),
            scale: scale.to_string(),
            scalars: emotion.scalars().as_array(),
            timestamp: Self::now_secs(),
            nonce: rand::random::<u64>(),
            pubkey: self.public_key_hex(),
            sig: String::new(),
        };
        let sig: DalekSignature = self.signing_key.sign(&envelope.signed_bytes());
        envelope.sig = hex::encode(sig.to_bytes());
        Signature(serde_json::to_string(&envelope).expect("envelope serializes"))
    }

    fn verify(&self, signature: &Signature, scale: &str) -> (bool, f64) {
        match self.try_verify(signature, scale) {
            Ok(()) => (true, 1.0),
            Err(err) => {
                warn!(error = %err, "signature verification failed");
                (false, 0.0)
            }
        }
    }
}

impl NodeSigner {
    fn try_verify(&self, signature: &Signature, scale: &str) -> Result<(), SecurityError> {
        let envelope: Envelope = serde_json::from_str(&signature.0)
            .map_err(|e| SecurityError::MalformedEnvelope(e.to_string()))?;

        if envelope.scale != scale {
            return Err(SecurityError::ScaleMismatch);
        }

        let now = Self::now_secs();
        if envelope.timestamp > now + 60 {
            return Err(SecurityError::FutureTimestamp);
        }
        if now.saturating_sub(envelope.timestamp) > self.max_message_age_secs {
            return Err(SecurityError::ExpiredMessage);
        }

        {
            let mut seen = self.seen_nonces.lock().expect("nonce set mutex poisoned");
            if seen.contains(&envelope.nonce) {
                return Err(SecurityError::ReplayDetected);
            }
            seen.insert(envelope.nonce);
            if seen.len() > 10_000 {
                seen.clear();
            }
        }

        let pubkey_bytes = hex::decode(&envelope.pubkey).map_err(|_| SecurityError::InvalidPublicKey)?;
        let pubkey_arr: [u8; 32] = pubkey_bytes
            .try_into()
            .map_err(|_| SecurityError::InvalidPublicKey)?;
        let verifying_key =
            VerifyingKey::from_bytes(&pubkey_arr).map_err(|_| SecurityError::InvalidPublicKey)?;

        let sig_bytes = hex::decode(&envelope.sig).map_err(|_| SecurityError::InvalidSignature)?;
        let sig_arr: [u8; 64] = sig_bytes.try_into().map_err(|_| SecurityError::InvalidSignature)?;
        let sig = DalekSignature::from_bytes(&sig_arr);

        verifying_key
            .verify(&envelope.signed_bytes(), &sig)
            .map_err(|_| SecurityError::InvalidSignature)
    }
}

/// Per-peer trust score in `[0, 1]`, keyed by a string peer identifier
/// (libp2p `PeerId` or `NodeId`, both rendered via `Display`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationManager {
    pub peers: std::collections::HashMap<String, f32>,
    db_path: PathBuf,
}

impl ReputationManager {
    pub fn new(db_path: PathBuf) -> Self {
        if db_path.exists() {
            if let Ok(content) = fs::read_to_string(&db_path) {
                if let Ok(loaded) = serde_json::from_str::<Self>(&content) {
                    return loaded;
                }
            }
        }
        Self {
            peers: std::collections::HashMap::new(),
            db_path,
        }
    }

    pub fn get_trust(&self, peer_id: &str) -> f32 {
        *self.peers.get(peer_id).unwrap_or(&0.5)
    }

    pub fn is_banned(&self, peer_id: &str) -> bool {
        self.get_trust(peer_id) < 0.2
    }

    pub fn reward(&mut self, peer_id: &str) {
        let entry = self.peers.entry(peer_id.to_string()).or_insert(0.5);
        *entry = (*entry + 0.01).min(1.0);
        let _ = self.save();
    }

    pub fn punish(&mut self, peer_id: &str) {
        let entry = self.peers.entry(peer_id.to_string()).or_insert(0.5);
        *entry = (*entry - 0.1).max(0.0);
        let _ = self.save();
    }

    /// Natural decay toward neutral, applied once per broadcast cadence so
    /// reputation earned once is not permanent.
    pub fn decay_all(&mut self, rate: f32) {
        for score in self.peers.values_mut() {
            *score = (*score - rate).max(0.0);
        }
        let _ = self.save();
    }

    fn save(&self) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).expect("reputation map serializes");
        fs::write(&self.db_path, json)
    }
}

/// Cloneable, shareable handle around a `ReputationManager`, needed because
/// `reward`/`punish` take `&mut self` but the scorer is read from two
/// independently spawned tasks: the transport ingress loop (punishes on
/// signature failure) and the federation coordinator (rewards on a
/// consensus response actually landing).
#[derive(Clone)]
pub struct ReputationHandle(std::sync::Arc<Mutex<ReputationManager>>);

impl ReputationHandle {
    pub fn new(manager: ReputationManager) -> Self {
        Self(std::sync::Arc::new(Mutex::new(manager)))
    }

    pub fn reward(&self, peer_id: &str) {
        self.0.lock().expect("reputation mutex poisoned").reward(peer_id);
    }

    pub fn punish(&self, peer_id: &str) {
        self.0.lock().expect("reputation mutex poisoned").punish(peer_id);
    }

    pub fn get_trust(&self, peer_id: &str) -> f32 {
        self.0.lock().expect("reputation mutex poisoned").get_trust(peer_id)
    }

    pub fn is_banned(&self, peer_id: &str) -> bool {
        self.0.lock().expect("reputation mutex poisoned").is_banned(peer_id)
    }

    pub fn decay_all(&self, rate: f32) {
        self.0.lock().expect("reputation mutex poisoned").decay_all(rate);
    }
}
