//! Deterministic harmonic transform used to embed text and emotion vectors
//! into a resonance-comparable representation.
//!
//! `rustfft` drives the transform. An earlier revision of this idea in the
//! teacher codebase (`qres_core::spectral`) swapped a real FFT predictor for
//! a last-value stub to dodge cross-architecture float drift in a numeric
//! *predictor*; here the transform is not a predictor feeding bit-exact
//! compression, only a resonance projection compared by cosine similarity,
//! so the small ULP-level differences `rustfft` can produce across targets
//! are immaterial and the real transform is kept.

use crate::vector::ContentVector;
use rustfft::{num_complex::Complex64, FftPlanner};
use std::sync::Arc;

pub struct FftCodec {
    dimension: usize,
    forward: Arc<dyn rustfft::Fft<f64>>,
    inverse: Arc<dyn rustfft::Fft<f64>>,
}

impl FftCodec {
    pub fn new(dimension: usize) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        Self {
            dimension,
            forward: planner.plan_fft_forward(dimension),
            inverse: planner.plan_fft_inverse(dimension),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Forward transform `f: R^D -> R^D`. A real input's FFT is conjugate
    /// symmetric (bin `k` is the conjugate of bin `D-k`), so the whole
    /// spectrum packs losslessly into `D` reals: bin 0 contributes one real,
    /// each interior pair `(k, D-k)` contributes its shared real/imaginary
    /// parts, and the Nyquist bin (when `D` is even) contributes one more
    /// real. `inverse` unpacks the same way, making `g(f(x)) == x` up to
    /// float rounding rather than only recovering the even part of `x`.
    pub fn forward(&self, input: &ContentVector) -> ContentVector {
        let mut buf = self.to_complex_buffer(input);
        self.forward.process(&mut buf);
        let scale = 1.0 / (self.dimension as f64).sqrt();
        ContentVector::new(self.pack_real(&buf, scale))
    }

    /// Inverse `g` such that `g(f(x)) ≈ x` within floating-point tolerance,
    /// reconstructing the full complex spectrum from the packed real vector
    /// before running the inverse FFT.
    pub fn inverse(&self, transformed: &ContentVector) -> ContentVector {
        let scale = 1.0 / (self.dimension as f64).sqrt();
        let mut buf = self.unpack_complex(&transformed.0, 1.0 / scale);
        self.inverse.process(&mut buf);
        let norm = 1.0 / self.dimension as f64;
        ContentVector::new(buf.iter().map(|c| c.re * norm).collect())
    }

    fn to_complex_buffer(&self, input: &ContentVector) -> Vec<Complex64> {
        let mut buf: Vec<Complex64> = input.0.iter().map(|&re| Complex64::new(re, 0.0)).collect();
        buf.resize(self.dimension, Complex64::new(0.0, 0.0));
        buf
    }

    /// Pack a real-input FFT's conjugate-symmetric spectrum into `self.dimension` reals.
    fn pack_real(&self, spectrum: &[Complex64], scale: f64) -> Vec<f64> {
        let d = self.dimension;
        let mut out = vec![0.0; d];
        if d == 0 {
            return out;
        }
        out[0] = spectrum[0].re * scale;
        let half = d / 2;
        for k in 1..half {
            out[2 * k - 1] = spectrum[k].re * scale;
            out[2 * k] = spectrum[k].im * scale;
        }
        if d % 2 == 0 {
            if half > 0 {
                out[d - 1] = spectrum[half].re * scale;
            }
        } else if half > 0 {
            out[2 * half - 1] = spectrum[half].re * scale;
            out[2 * half] = spectrum[half].im * scale;
        }
        out
    }

    /// Inverse of `pack_real`: rebuild the full conjugate-symmetric spectrum.
    fn unpack_complex(&self, packed: &[f64], unscale: f64) -> Vec<Complex64> {
        let d = self.dimension;
        let mut spectrum = vec![Complex64::new(0.0, 0.0); d];
        if d == 0 {
            return spectrum;
        }
        let get = |i: usize| packed.get(i).copied().unwrap_or(0.0) * unscale;
        spectrum[0] = Complex64::new(get(0), 0.0);
        let half = d / 2;
        for k in 1..half {
            let re = get(2 * k - 1);
            let im = get(2 * k);
            spectrum[k] = Complex64::new(re, im);
            spectrum[d - k] = Complex64::new(re, -im);
        }
        if d % 2 == 0 {
            if half > 0 {
                spectrum[half] = Complex64::new(get(d - 1), 0.0);
            }
        } else if half > 0 {
            let re = get(2 * half - 1);
            let im = get(2 * half);
            spectrum[half] = Complex64::new(re, im);
            spectrum[d - half] = Complex64::new(re, -im);
        }
        spectrum
    }

    /// Deterministically project arbitrary text into a content vector: hash
    /// the bytes into an initial vector, then apply the forward transform.
    pub fn embed_text(&self, text: &str) -> ContentVector {
        let hash = blake3::hash(text.as_bytes());
        let hash_bytes = hash.as_bytes();
        let seed: Vec<f64> = (0..self.dimension)
            .map(|i| {
                let byte = hash_bytes[i % hash_bytes.len()];
                // Re-hash the index in with the digest so repeating the 32
                // hash bytes across a 128-dim vector still varies per slot.
                let salted = blake3::hash(&[byte, (i & 0xFF) as u8, (i >> 8) as u8]);
                let v = salted.as_bytes()[0] as f64 / 255.0;
                v * 2.0 - 1.0
            })
            .collect();
        self.forward(&ContentVector::new(seed).normalized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_recovers_original_within_tolerance() {
        let codec = FftCodec::new(16);
        let input = ContentVector::new((0..16).map(|i| (i as f64).sin()).collect());
        let transformed = codec.forward(&input);
        let recovered = codec.inverse(&transformed);
        for (a, b) in input.0.iter().zip(recovered.0.iter()) {
            assert!((a - b).abs() < 1e-8, "expected {a} got {b}");
        }
    }

    #[test]
    fn inverse_recovers_odd_length_input() {
        let codec = FftCodec::new(9);
        let input = ContentVector::new((0..9).map(|i| (i as f64 * 0.7).cos()).collect());
        let transformed = codec.forward(&input);
        let recovered = codec.inverse(&transformed);
        for (a, b) in input.0.iter().zip(recovered.0.iter()) {
            assert!((a - b).abs() < 1e-8, "expected {a} got {b}");
        }
    }

    #[test]
    fn forward_is_deterministic() {
        let codec = FftCodec::new(32);
        let input = ContentVector::new((0..32).map(|i| i as f64 * 0.1).collect());
        assert_eq!(codec.forward(&input), codec.forward(&input));
    }

    #[test]
    fn embed_text_is_deterministic_and_normalized() {
        let codec = FftCodec::new(DEFAULT_DIM_FOR_TEST);
        let a = codec.embed_text("hello federation");
        let b = codec.embed_text("hello federation");
        assert_eq!(a, b);
        let c = codec.embed_text("a different prompt entirely");
        assert_ne!(a, c);
    }

    const DEFAULT_DIM_FOR_TEST: usize = 128;

    #[test]
    fn linearity_holds_for_scaled_input() {
        let codec = FftCodec::new(16);
        let x = ContentVector::new((0..16).map(|i| i as f64).collect());
        let scaled = ContentVector::new(x.0.iter().map(|v| v * 2.0).collect());
        let fx = codec.forward(&x);
        let f_scaled = codec.forward(&scaled);
        for (a, b) in fx.0.iter().zip(f_scaled.0.iter()) {
            assert!((a * 2.0 - b).abs() < 1e-8);
        }
    }
}
