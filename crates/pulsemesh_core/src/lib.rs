//! Wire types, the FFT-based resonance codec, the `Signer`/`Consent` ports,
//! and the consensus reducers shared by every PulseMesh node.
//!
//! This crate has no knowledge of networking, persistence, or process
//! lifecycle — those live in `pulsemesh_node`. It is pure data model plus
//! pure functions, kept that way so the reducers and codecs stay trivially
//! testable in isolation.

pub mod consensus;
pub mod consent;
pub mod fft;
pub mod ids;
pub mod signer;
pub mod vector;
pub mod wire;

pub use consensus::{reduce, AdaptiveEnsembleState, ConsensusMethod, ConsensusResult, Response, Selected};
pub use consent::{Consent, ConsentContext, ConsentKind, ConsentResult};
pub use fft::FftCodec;
pub use ids::{MessageId, NodeId, RecordId, RequestId};
pub use signer::{Signature, Signer};
pub use vector::{ContentVector, EmotionalScalars, EmotionalVector, HarmonicRepresentation, DEFAULT_DIMENSION};
pub use wire::{FoldPattern, Intent, Layer, Message, Priority, ScaleLevel, WireCodec, WireError};
