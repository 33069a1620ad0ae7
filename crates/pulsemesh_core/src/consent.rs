//! `Consent` — the per-send gate port.
//!
//! `Consent.verify` runs before egress; the core sets `message.consent_verified`
//! from its outcome and refuses to send on denial. A separate trait from
//! `Signer` because consent policy (always-on, interactive prompt,
//! reputation-gated) is an orthogonal axis from identity/signing.

use crate::vector::ContentVector;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsentKind {
    Full,
    Partial,
    Denied,
}

impl ConsentKind {
    pub fn granted(self) -> bool {
        !matches!(self, ConsentKind::Denied)
    }

    /// Maps to the `Record.consent_level` scale from spec §3: granted→5,
    /// partial→3, otherwise→1.
    pub fn record_level(self) -> u8 {
        match self {
            ConsentKind::Full => 5,
            ConsentKind::Partial => 3,
            ConsentKind::Denied => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsentContext {
    pub scale_level: String,
    pub fold_pattern: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsentResult {
    pub granted: bool,
    pub kind: ConsentKind,
    pub score: f64,
}

pub trait Consent: Send + Sync {
    fn verify(&self, vector: &ContentVector, context: &ConsentContext) -> ConsentResult;
}

/// Grants full consent unconditionally; the common default for nodes that
/// don't enforce a policy.
#[derive(Clone, Debug, Default)]
pub struct AlwaysGrantConsent;

impl Consent for AlwaysGrantConsent {
    fn verify(&self, _vector: &ContentVector, _context: &ConsentContext) -> ConsentResult {
        ConsentResult {
            granted: true,
            kind: ConsentKind::Full,
            score: 1.0,
        }
    }
}

/// Denies unconditionally; used by tests exercising the `ConsentDenied` path.
#[derive(Clone, Debug, Default)]
pub struct AlwaysDenyConsent;

impl Consent for AlwaysDenyConsent {
    fn verify(&self, _vector: &ContentVector, _context: &ConsentContext) -> ConsentResult {
        ConsentResult {
            granted: false,
            kind: ConsentKind::Denied,
            score: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_grant_consent_grants_full() {
        let consent = AlwaysGrantConsent;
        let ctx = ConsentContext {
            scale_level: "LOCAL".into(),
            fold_pattern: "NONE".into(),
        };
        let result = consent.verify(&ContentVector::new(vec![0.0; 4]), &ctx);
        assert!(result.granted);
        assert_eq!(result.kind.record_level(), 5);
    }

    #[test]
    fn always_deny_consent_denies() {
        let consent = AlwaysDenyConsent;
        let ctx = ConsentContext {
            scale_level: "LOCAL".into(),
            fold_pattern: "NONE".into(),
        };
        let result = consent.verify(&ContentVector::new(vec![0.0; 4]), &ctx);
        assert!(!result.granted);
        assert_eq!(result.kind.record_level(), 1);
    }
}
