//! `Message` — the wire entity — and `WireCodec`, its self-describing
//! textual (JSON-equivalent) encoding.
//!
//! Numeric vectors travel as base64-wrapped little-endian `f64` arrays
//! rather than JSON number arrays, matching the ABI fixed in spec §6.
//! Unknown fields on decode are folded into `metadata` for forward
//! compatibility, the same policy the teacher's config loader applies to
//! unrecognised TOML keys.

use crate::ids::{MessageId, NodeId};
use crate::signer::Signature;
use crate::vector::{ContentVector, EmotionalScalars, EmotionalVector, HarmonicRepresentation};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use std::io::Cursor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layer {
    #[serde(rename = "WIFI_MESH")]
    WifiMesh,
    #[serde(rename = "BLE_PROXIMITY")]
    BleProximity,
    #[serde(rename = "SYNCTHING_MEMORY")]
    SyncthingMemory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    #[serde(rename = "STATE_BROADCAST")]
    StateBroadcast,
    #[serde(rename = "IDENTITY_VERIFICATION")]
    IdentityVerification,
    #[serde(rename = "CONSENSUS_REQUEST")]
    ConsensusRequest,
    #[serde(rename = "CONSENSUS_RESPONSE")]
    ConsensusResponse,
    #[serde(rename = "RESONANCE_CHECK")]
    ResonanceCheck,
    #[serde(rename = "EMOTIONAL_SYNC")]
    EmotionalSync,
    #[serde(rename = "MEMORY_COMMIT")]
    MemoryCommit,
    #[serde(rename = "FOLD_PROPAGATION")]
    FoldPropagation,
    #[serde(rename = "PROXIMITY_AWARENESS")]
    ProximityAwareness,
    #[serde(rename = "DREAM_SHARING")]
    DreamSharing,
    #[serde(rename = "CONSENT_VERIFICATION")]
    ConsentVerification,
}

/// Ordered low-to-high for back-pressure eviction (spec §5): `DREAM` is
/// dropped first when a bounded queue is full, `EMERGENCY` never is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    #[serde(rename = "DREAM")]
    Dream,
    #[serde(rename = "BACKGROUND")]
    Background,
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "CRITICAL")]
    Critical,
    #[serde(rename = "EMERGENCY")]
    Emergency,
}

/// Closed to the external ports, opaque to the core; carried as a plain
/// string tag (spec §3: "the core only uses them as opaque tags").
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScaleLevel(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FoldPattern(pub String);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub sender_id: NodeId,
    pub sender_name: String,
    pub receiver_id: Option<NodeId>,
    pub layer: Layer,
    pub intent: Intent,
    pub priority: Priority,
    pub content: String,
    pub content_vector: Option<ContentVector>,
    pub emotional_vector: Option<EmotionalVector>,
    pub resonance_signature: Option<Signature>,
    pub consent_verified: bool,
    pub fold_id: Option<String>,
    pub scale_level: ScaleLevel,
    pub fold_pattern: FoldPattern,
    pub timestamp: f64,
    pub expiration: Option<f64>,
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn is_expired(&self, now: f64) -> bool {
        self.expiration.map(|e| now > e).unwrap_or(false)
    }

    pub fn is_self_addressed_drop(&self, local: &NodeId) -> bool {
        &self.sender_id == local
    }

    pub fn topic(&self) -> String {
        match &self.receiver_id {
            None => "broadcast".to_string(),
            Some(id) => format!("nodes/{id}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("invalid base64 vector encoding: {0}")]
    InvalidVector(String),
}

fn encode_f64_array(values: &[f64]) -> String {
    let mut buf = Vec::with_capacity(values.len() * 8);
    for v in values {
        buf.write_f64::<LittleEndian>(*v).expect("write to Vec cannot fail");
    }
    STANDARD.encode(buf)
}

fn decode_f64_array(encoded: &str) -> Result<Vec<f64>, WireError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| WireError::InvalidVector(e.to_string()))?;
    if bytes.len() % 8 != 0 {
        return Err(WireError::InvalidVector(
            "byte length not a multiple of 8".into(),
        ));
    }
    let mut cursor = Cursor::new(bytes);
    let mut out = Vec::with_capacity(cursor.get_ref().len() / 8);
    while (cursor.position() as usize) < cursor.get_ref().len() {
        out.push(
            cursor
                .read_f64::<LittleEndian>()
                .map_err(|e| WireError::InvalidVector(e.to_string()))?,
        );
    }
    Ok(out)
}

/// Repeating-key XOR obfuscation layered over the base64 payload. This is
/// obfuscation, not cryptography: authenticity comes entirely from `Signer`.
fn xor_repeating(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()])
        .collect()
}

pub struct WireCodec {
    obfuscation_key: Option<Vec<u8>>,
}

impl WireCodec {
    pub fn new() -> Self {
        Self {
            obfuscation_key: None,
        }
    }

    pub fn with_obfuscation_key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            obfuscation_key: Some(key.into()),
        }
    }

    pub fn encode(&self, message: &Message) -> Result<String, WireError> {
        let mut obj = Map::new();
        obj.insert("message_id".into(), Value::String(message.message_id.to_string()));
        obj.insert("sender_id".into(), Value::String(message.sender_id.to_string()));
        obj.insert("sender_name".into(), Value::String(message.sender_name.clone()));
        obj.insert(
            "receiver_id".into(),
            match &message.receiver_id {
                Some(id) => Value::String(id.to_string()),
                None => Value::Null,
            },
        );
        obj.insert(
            "layer".into(),
            serde_json::to_value(message.layer).expect("Layer serializes"),
        );
        obj.insert(
            "intent".into(),
            serde_json::to_value(message.intent).expect("Intent serializes"),
        );
        obj.insert(
            "priority".into(),
            serde_json::to_value(message.priority).expect("Priority serializes"),
        );
        obj.insert("content".into(), Value::String(message.content.clone()));
        obj.insert(
            "content_vector".into(),
            match &message.content_vector {
                Some(v) => Value::String(encode_f64_array(&v.0)),
                None => Value::Null,
            },
        );
        obj.insert(
            "emotional_vector".into(),
            match &message.emotional_vector {
                Some(v) => Value::String(encode_f64_array(&emotional_vector_to_flat(v))),
                None => Value::Null,
            },
        );
        obj.insert(
            "resonance_signature".into(),
            match &message.resonance_signature {
                Some(sig) => Value::String(sig.0.clone()),
                None => Value::Null,
            },
        );
        obj.insert("consent_verified".into(), Value::Bool(message.consent_verified));
        obj.insert(
            "fold_id".into(),
            match &message.fold_id {
                Some(id) => Value::String(id.clone()),
                None => Value::Null,
            },
        );
        obj.insert("scale_level".into(), Value::String(message.scale_level.0.clone()));
        obj.insert("fold_pattern".into(), Value::String(message.fold_pattern.0.clone()));
        obj.insert(
            "timestamp".into(),
            serde_json::Number::from_f64(message.timestamp)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        );
        obj.insert(
            "expiration".into(),
            match message.expiration {
                Some(e) => serde_json::Number::from_f64(e).map(Value::Number).unwrap_or(Value::Null),
                None => Value::Null,
            },
        );
        obj.insert("metadata".into(), Value::Object(message.metadata.clone()));

        let plain = serde_json::to_vec(&Value::Object(obj))
            .map_err(|e| WireError::Malformed(e.to_string()))?;

        let payload = match &self.obfuscation_key {
            Some(key) => xor_repeating(&plain, key),
            None => plain,
        };
        Ok(STANDARD.encode(payload))
    }

    pub fn decode(&self, payload: &str) -> Result<Message, WireError> {
        let raw = STANDARD
            .decode(payload)
            .map_err(|e| WireError::Malformed(e.to_string()))?;
        let plain = match &self.obfuscation_key {
            Some(key) => xor_repeating(&raw, key),
            None => raw,
        };
        let mut value: Value =
            serde_json::from_slice(&plain).map_err(|e| WireError::Malformed(e.to_string()))?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| WireError::Malformed("payload is not a JSON object".into()))?;

        let take_str = |obj: &mut Map<String, Value>, key: &str| -> Option<String> {
            obj.remove(key).and_then(|v| v.as_str().map(str::to_string))
        };

        let message_id: MessageId = take_str(obj, "message_id")
            .ok_or_else(|| WireError::Malformed("missing message_id".into()))?
            .into();
        let sender_id: NodeId = take_str(obj, "sender_id")
            .ok_or_else(|| WireError::Malformed("missing sender_id".into()))?
            .into();
        let sender_name = take_str(obj, "sender_name").unwrap_or_default();
        let receiver_id = take_str(obj, "receiver_id").map(NodeId::from);

        let layer: Layer = obj
            .remove("layer")
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| WireError::Malformed("missing or invalid layer".into()))?;
        let intent: Intent = obj
            .remove("intent")
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| WireError::Malformed("missing or invalid intent".into()))?;
        let priority: Priority = obj
            .remove("priority")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(Priority::Normal);

        let content = take_str(obj, "content").unwrap_or_default();

        let content_vector = match obj.remove("content_vector") {
            Some(Value::String(s)) => Some(ContentVector::new(decode_f64_array(&s)?)),
            _ => None,
        };

        let emotional_vector = match obj.remove("emotional_vector") {
            Some(Value::String(s)) => Some(emotional_vector_from_flat(&decode_f64_array(&s)?)?),
            _ => None,
        };

        let resonance_signature = take_str(obj, "resonance_signature").map(Signature);
        let consent_verified = obj
            .remove("consent_verified")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let fold_id = take_str(obj, "fold_id");
        let scale_level = ScaleLevel(take_str(obj, "scale_level").unwrap_or_default());
        let fold_pattern = FoldPattern(take_str(obj, "fold_pattern").unwrap_or_default());
        let timestamp = obj
            .remove("timestamp")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| WireError::Malformed("missing timestamp".into()))?;
        let expiration = obj.remove("expiration").and_then(|v| v.as_f64());
        let metadata = match obj.remove("metadata") {
            Some(Value::Object(m)) => m,
            _ => Map::new(),
        };

        // Anything left over (unknown fields) is forward-compatibly folded
        // into metadata rather than discarded.
        let mut metadata = metadata;
        for (k, v) in obj.drain() {
            metadata.entry(k).or_insert(v);
        }

        Ok(Message {
            message_id,
            sender_id,
            sender_name,
            receiver_id,
            layer,
            intent,
            priority,
            content,
            content_vector,
            emotional_vector,
            resonance_signature,
            consent_verified,
            fold_id,
            scale_level,
            fold_pattern,
            timestamp,
            expiration,
            metadata,
        })
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Flattens an `EmotionalVector` into a single f64 array: the 7 scalars,
/// followed by the harmonic field's values when present. Decoding treats
/// anything beyond the first 7 entries as the harmonic field.
fn emotional_vector_to_flat(v: &EmotionalVector) -> Vec<f64> {
    let mut out = v.scalars().as_array().to_vec();
    if let Some(field) = v.harmonic_field() {
        out.extend_from_slice(&field.0);
    }
    out
}

fn emotional_vector_from_flat(flat: &[f64]) -> Result<EmotionalVector, WireError> {
    if flat.len() < 7 {
        return Err(WireError::Malformed(
            "emotional_vector payload shorter than 7 scalars".into(),
        ));
    }
    let mut arr = [0.0f64; 7];
    arr.copy_from_slice(&flat[..7]);
    let scalars = EmotionalScalars::from_array(arr);
    if flat.len() == 7 {
        Ok(EmotionalVector(HarmonicRepresentation::Scalars(scalars)))
    } else {
        Ok(EmotionalVector(HarmonicRepresentation::Harmonic {
            scalars,
            field: ContentVector::new(flat[7..].to_vec()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        Message {
            message_id: MessageId::generate(),
            sender_id: NodeId::generate(),
            sender_name: "node-a".into(),
            receiver_id: None,
            layer: Layer::WifiMesh,
            intent: Intent::StateBroadcast,
            priority: Priority::Normal,
            content: "hello".into(),
            content_vector: Some(ContentVector::new(vec![0.1, 0.2, 0.3])),
            emotional_vector: Some(EmotionalVector::from_scalars(EmotionalScalars::neutral())),
            resonance_signature: None,
            consent_verified: true,
            fold_id: None,
            scale_level: ScaleLevel("LOCAL".into()),
            fold_pattern: FoldPattern("NONE".into()),
            timestamp: 1_700_000_000.0,
            expiration: None,
            metadata: Map::new(),
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let codec = WireCodec::new();
        let msg = sample_message();
        let encoded = codec.encode(&msg).unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn obfuscation_round_trips_and_differs_from_plain() {
        let plain_codec = WireCodec::new();
        let obfuscated_codec = WireCodec::with_obfuscation_key(b"secret".to_vec());
        let msg = sample_message();

        let plain = plain_codec.encode(&msg).unwrap();
        let obfuscated = obfuscated_codec.encode(&msg).unwrap();
        assert_ne!(plain, obfuscated);

        let decoded = obfuscated_codec.decode(&obfuscated).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn harmonic_field_round_trips() {
        let codec = WireCodec::new();
        let mut msg = sample_message();
        msg.emotional_vector = Some(EmotionalVector::with_harmonic_field(
            EmotionalScalars::neutral(),
            ContentVector::new(vec![0.5, 0.25, 0.125]),
        ));
        let encoded = codec.encode(&msg).unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn unknown_fields_fold_into_metadata() {
        let codec = WireCodec::new();
        let msg = sample_message();
        let encoded = codec.encode(&msg).unwrap();
        let raw = STANDARD.decode(&encoded).unwrap();
        let mut value: Value = serde_json::from_slice(&raw).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("future_field".into(), Value::String("from the future".into()));
        let replayed = STANDARD.encode(serde_json::to_vec(&value).unwrap());

        let decoded = codec.decode(&replayed).unwrap();
        assert_eq!(
            decoded.metadata.get("future_field").and_then(|v| v.as_str()),
            Some("from the future")
        );
    }
}
