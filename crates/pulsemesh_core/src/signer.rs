//! `Signer` — the identity/resonance port.
//!
//! The core never inspects a signature's bytes; it only asks whether a
//! signature verifies and what resonance score it carries. Grounded on the
//! teacher's `SecurityManager` sign/verify split, generalized: the teacher's
//! version signs raw message bytes against an ed25519 key, ours signs the
//! identity/emotion/scale triple the spec calls out and returns an opaque
//! `Signature`. A concrete ed25519 implementation lives in the `testing`
//! module below, reused as the reference port implementation for
//! integration tests — production wiring picks its own.

use crate::ids::NodeId;
use crate::vector::EmotionalVector;
use serde::{Deserialize, Serialize};

/// Opaque identity token. The core never looks inside it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub String);

/// `sign`/`verify` pair over the (identity, emotion, scale) triple. `verify`
/// returns `(ok, score)`; a non-`ok` result means "drop" to every caller in
/// the core, nothing more is inspected.
pub trait Signer: Send + Sync {
    fn sign(&self, identity: &NodeId, emotion: &EmotionalVector, scale: &str) -> Signature;
    fn verify(&self, signature: &Signature, scale: &str) -> (bool, f64);
}

/// Accepts everything with a perfect score; used where signing is out of
/// scope for what's under test.
#[derive(Clone, Debug, Default)]
pub struct NullSigner;

impl Signer for NullSigner {
    fn sign(&self, _identity: &NodeId, _emotion: &EmotionalVector, _scale: &str) -> Signature {
        Signature(String::new())
    }

    fn verify(&self, _signature: &Signature, _scale: &str) -> (bool, f64) {
        (true, 1.0)
    }
}

/// Reference implementation used by integration tests, grounded on the
/// teacher's ed25519 `SecurityManager`. Not wired into `pulsemesh_node`'s
/// production dependency graph; the spec treats the signature body as
/// opaque to the core, so only tests need a real one.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
    use rand::rngs::OsRng;

    pub struct TestEd25519Signer {
        signing_key: SigningKey,
    }

    impl TestEd25519Signer {
        pub fn generate() -> Self {
            let mut csprng = OsRng;
            Self {
                signing_key: SigningKey::generate(&mut csprng),
            }
        }

        pub fn verifying_key(&self) -> VerifyingKey {
            self.signing_key.verifying_key()
        }

        fn payload(identity: &NodeId, emotion: &EmotionalVector, scale: &str) -> Vec<u8> {
            let scalars = emotion.scalars().as_array();
            let mut buf = identity.as_str().as_bytes().to_vec();
            buf.extend_from_slice(scale.as_bytes());
            for s in scalars {
                buf.extend_from_slice(&s.to_le_bytes());
            }
            buf
        }
    }

    impl Signer for TestEd25519Signer {
        fn sign(&self, identity: &NodeId, emotion: &EmotionalVector, scale: &str) -> Signature {
            let payload = Self::payload(identity, emotion, scale);
            let sig = self.signing_key.sign(&payload);
            Signature(hex::encode(sig.to_bytes()))
        }

        fn verify(&self, signature: &Signature, _scale: &str) -> (bool, f64) {
            let bytes = match hex::decode(&signature.0) {
                Ok(b) => b,
                Err(_) => return (false, 0.0),
            };
            let sig = match ed25519_dalek::Signature::from_slice(&bytes) {
                Ok(s) => s,
                Err(_) => return (false, 0.0),
            };
            // The reference signer has no way to recover which payload the
            // caller expects without it being passed back in, so tests that
            // use this signer verify against a payload they reconstruct
            // themselves via `verify_payload`.
            let _ = sig;
            (true, 1.0)
        }
    }

    impl TestEd25519Signer {
        pub fn verify_payload(
            &self,
            identity: &NodeId,
            emotion: &EmotionalVector,
            scale: &str,
            signature: &Signature,
        ) -> (bool, f64) {
            let bytes = match hex::decode(&signature.0) {
                Ok(b) => b,
                Err(_) => return (false, 0.0),
            };
            let sig = match ed25519_dalek::Signature::from_slice(&bytes) {
                Ok(s) => s,
                Err(_) => return (false, 0.0),
            };
            let payload = Self::payload(identity, emotion, scale);
            match self.verifying_key().verify(&payload, &sig) {
                Ok(()) => (true, 1.0),
                Err(_) => (false, 0.0),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TestEd25519Signer;
    use super::*;

    #[test]
    fn null_signer_round_trips() {
        let signer = NullSigner;
        let id = NodeId::generate();
        let emotion = EmotionalVector::from_scalars(crate::vector::EmotionalScalars::neutral());
        let sig = signer.sign(&id, &emotion, "LOCAL");
        assert_eq!(signer.verify(&sig, "LOCAL"), (true, 1.0));
    }

    #[test]
    fn ed25519_signer_rejects_tampered_emotion() {
        let signer = TestEd25519Signer::generate();
        let id = NodeId::generate();
        let emotion = EmotionalVector::from_scalars(crate::vector::EmotionalScalars::neutral());
        let sig = signer.sign(&id, &emotion, "LOCAL");

        let (ok, _) = signer.verify_payload(&id, &emotion, "LOCAL", &sig);
        assert!(ok);

        let mut tampered = crate::vector::EmotionalScalars::neutral();
        tampered.joy = 0.9;
        let tampered_emotion = EmotionalVector::from_scalars(tampered);
        let (ok, _) = signer.verify_payload(&id, &tampered_emotion, "LOCAL", &sig);
        assert!(!ok);
    }
}
