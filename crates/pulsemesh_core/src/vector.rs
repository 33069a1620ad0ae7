//! `ContentVector` and `EmotionalVector` — the numeric payload shared between
//! resonance comparison, the wire codec, and the proximity beacon.

use serde::{Deserialize, Serialize};

/// Fixed-length numeric projection used for resonance comparison. Default
/// dimension is 128 (`DEFAULT_DIMENSION`), but the dimension travels with the
/// vector since callers may embed at other widths.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentVector(pub Vec<f64>);

pub const DEFAULT_DIMENSION: usize = 128;

impl ContentVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn l2_norm(&self) -> f64 {
        self.0.iter().map(|x| x * x).sum::<f64>().sqrt()
    }

    /// Vectors are treated as ill-formed on ingress unless normalized within
    /// floating-point tolerance.
    pub fn is_normalized(&self, tolerance: f64) -> bool {
        (self.l2_norm() - 1.0).abs() <= tolerance
    }

    pub fn normalize(&mut self) {
        let norm = self.l2_norm();
        if norm > 0.0 {
            for x in self.0.iter_mut() {
                *x /= norm;
            }
        }
    }

    pub fn normalized(&self) -> Self {
        let mut v = self.clone();
        v.normalize();
        v
    }

    /// Cosine similarity, the sole comparison operator resonance reducers need.
    pub fn cosine_similarity(&self, other: &ContentVector) -> f64 {
        let dims = self.0.len().min(other.0.len());
        if dims == 0 {
            return 0.0;
        }
        let dot: f64 = self.0[..dims]
            .iter()
            .zip(&other.0[..dims])
            .map(|(a, b)| a * b)
            .sum();
        let denom = self.l2_norm() * other.l2_norm();
        if denom == 0.0 {
            0.0
        } else {
            dot / denom
        }
    }
}

/// The seven named scalar emotion dimensions, each in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmotionalScalars {
    pub joy: f64,
    pub curiosity: f64,
    pub concern: f64,
    pub creativity: f64,
    pub restfulness: f64,
    pub attentiveness: f64,
    pub empathy: f64,
}

impl EmotionalScalars {
    pub fn neutral() -> Self {
        Self {
            joy: 0.5,
            curiosity: 0.5,
            concern: 0.5,
            creativity: 0.5,
            restfulness: 0.5,
            attentiveness: 0.5,
            empathy: 0.5,
        }
    }

    pub fn clamp(&mut self) {
        for v in self.as_array_mut() {
            *v = v.clamp(0.0, 1.0);
        }
    }

    pub fn as_array(&self) -> [f64; 7] {
        [
            self.joy,
            self.curiosity,
            self.concern,
            self.creativity,
            self.restfulness,
            self.attentiveness,
            self.empathy,
        ]
    }

    fn as_array_mut(&mut self) -> [&mut f64; 7] {
        [
            &mut self.joy,
            &mut self.curiosity,
            &mut self.concern,
            &mut self.creativity,
            &mut self.restfulness,
            &mut self.attentiveness,
            &mut self.empathy,
        ]
    }

    pub fn from_array(a: [f64; 7]) -> Self {
        Self {
            joy: a[0],
            curiosity: a[1],
            concern: a[2],
            creativity: a[3],
            restfulness: a[4],
            attentiveness: a[5],
            empathy: a[6],
        }
    }

    /// Linear blend toward `other` with weight `w` capped to `[0, 1]`.
    pub fn blend(&self, other: &EmotionalScalars, w: f64) -> Self {
        let w = w.clamp(0.0, 1.0);
        let a = self.as_array();
        let b = other.as_array();
        let mut out = [0.0; 7];
        for i in 0..7 {
            out[i] = (1.0 - w) * a[i] + w * b[i];
        }
        Self::from_array(out)
    }
}

/// A harmonic field, when present, is the authoritative representation of an
/// emotional state; the scalars become a human-readable projection only. This
/// is modelled as a tagged variant (not an `Option` fallback) per the
/// redesign guidance: call sites must handle both cases explicitly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HarmonicRepresentation {
    Scalars(EmotionalScalars),
    Harmonic {
        scalars: EmotionalScalars,
        field: ContentVector,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmotionalVector(pub HarmonicRepresentation);

impl EmotionalVector {
    pub fn from_scalars(scalars: EmotionalScalars) -> Self {
        Self(HarmonicRepresentation::Scalars(scalars))
    }

    pub fn with_harmonic_field(scalars: EmotionalScalars, field: ContentVector) -> Self {
        Self(HarmonicRepresentation::Harmonic { scalars, field })
    }

    pub fn scalars(&self) -> &EmotionalScalars {
        match &self.0 {
            HarmonicRepresentation::Scalars(s) => s,
            HarmonicRepresentation::Harmonic { scalars, .. } => scalars,
        }
    }

    pub fn scalars_mut(&mut self) -> &mut EmotionalScalars {
        match &mut self.0 {
            HarmonicRepresentation::Scalars(s) => s,
            HarmonicRepresentation::Harmonic { scalars, .. } => scalars,
        }
    }

    pub fn harmonic_field(&self) -> Option<&ContentVector> {
        match &self.0 {
            HarmonicRepresentation::Scalars(_) => None,
            HarmonicRepresentation::Harmonic { field, .. } => Some(field),
        }
    }

    /// Blend two emotional vectors. When either side carries a harmonic
    /// field it is treated as authoritative and blended in vector space;
    /// otherwise the scalar projection is blended directly.
    pub fn blend(&self, other: &EmotionalVector, w: f64) -> EmotionalVector {
        let blended_scalars = self.scalars().blend(other.scalars(), w);
        match (self.harmonic_field(), other.harmonic_field()) {
            (Some(a), Some(b)) => {
                let w = w.clamp(0.0, 1.0);
                let dims = a.0.len().min(b.0.len());
                let field = ContentVector::new(
                    (0..dims)
                        .map(|i| (1.0 - w) * a.0[i] + w * b.0[i])
                        .collect(),
                );
                EmotionalVector::with_harmonic_field(blended_scalars, field)
            }
            (Some(a), None) => EmotionalVector::with_harmonic_field(blended_scalars, a.clone()),
            (None, Some(b)) => EmotionalVector::with_harmonic_field(blended_scalars, b.clone()),
            (None, None) => EmotionalVector::from_scalars(blended_scalars),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_norm() {
        let v = ContentVector::new(vec![3.0, 4.0]).normalized();
        assert!((v.l2_norm() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = ContentVector::new(vec![1.0, 2.0, 3.0]);
        assert!((v.cosine_similarity(&v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn blend_weight_is_capped() {
        let a = EmotionalScalars {
            joy: 0.5,
            ..EmotionalScalars::neutral()
        };
        let b = EmotionalScalars {
            joy: 1.0,
            ..EmotionalScalars::neutral()
        };
        let blended = a.blend(&b, 5.0); // over-large weight clamps to 1.0
        assert!((blended.joy - 1.0).abs() < 1e-9);
    }

    #[test]
    fn proximity_blend_matches_spec_example() {
        // Scenario 6: joy=0.5 local, joy=1.0 remote, proximity weight 0.3.
        let local = EmotionalScalars {
            joy: 0.5,
            ..EmotionalScalars::neutral()
        };
        let remote = EmotionalScalars {
            joy: 1.0,
            ..EmotionalScalars::neutral()
        };
        let blended = local.blend(&remote, 0.3);
        assert!((blended.joy - 0.65).abs() < 1e-9);
    }
}
