//! Consensus reducers (spec §4.7).
//!
//! Grounded directly on `qres_core::aggregation`'s shape: a closed enum of
//! modes, a single dispatch function, one pure helper per mode, total over
//! any non-empty input, deterministic, never mutating its inputs. That
//! module reduced numeric weight vectors (`Krum`, trimmed mean, median);
//! this one reduces `Response` maps over `(content, confidence, resonance)`,
//! but keeps the same contract and the same "helper function per mode,
//! dispatched from one entry point" structure.

use crate::fft::FftCodec;
use crate::ids::NodeId;
use crate::vector::DEFAULT_DIMENSION;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub content: String,
    pub model_id: String,
    pub confidence: f64,
    pub resonance: f64,
    pub consent_verified: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selected {
    Node(NodeId),
    Blend,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub content: String,
    pub selected: Selected,
    pub confidence: f64,
    pub resonance: f64,
    pub metadata: Map<String, Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusMethod {
    MajorityVote,
    WeightedConfidence,
    ResonancePriority,
    HarmonicBlend,
    XorFiltering,
    AdaptiveEnsemble,
    DelegateDiscuss,
}

/// Per-peer running estimate for `ADAPTIVE_ENSEMBLE`, keyed by `(peer,
/// coarse prompt fingerprint)`. Per the open-question decision in spec §9:
/// treated as stateless unless this is threaded in explicitly by the caller.
#[derive(Clone, Debug, Default)]
pub struct AdaptiveEnsembleState {
    history: BTreeMap<(NodeId, u64), (f64, f64)>,
}

impl AdaptiveEnsembleState {
    pub fn new() -> Self {
        Self::default()
    }

    fn fingerprint(prompt: &str) -> u64 {
        let hash = blake3::hash(prompt.as_bytes());
        u64::from_le_bytes(hash.as_bytes()[..8].try_into().expect("8 bytes"))
    }

    fn observe(&mut self, peer: &NodeId, prompt: &str, confidence: f64, resonance: f64) {
        self.history
            .insert((peer.clone(), Self::fingerprint(prompt)), (confidence, resonance));
    }

    fn predicted(&self, peer: &NodeId, prompt: &str) -> Option<(f64, f64)> {
        self.history.get(&(peer.clone(), Self::fingerprint(prompt))).copied()
    }
}

/// Blend weight between freshly observed and historically predicted score
/// in `ADAPTIVE_ENSEMBLE`. An implementation choice; the spec only
/// constrains the shape of the blend, not this constant.
const ADAPTIVE_BLEND_DELTA: f64 = 0.5;

/// Weights for `XOR_FILTERING`'s composite score. Implementation choice;
/// the spec names the three terms without fixing their weights.
const XOR_ALPHA_CONFIDENCE: f64 = 0.4;
const XOR_BETA_RESONANCE: f64 = 0.3;
const XOR_GAMMA_UNIQUENESS: f64 = 0.3;

pub fn reduce(
    method: ConsensusMethod,
    responses: &BTreeMap<NodeId, Response>,
    prompt: &str,
    state: Option<&mut AdaptiveEnsembleState>,
) -> ConsensusResult {
    debug_assert!(!responses.is_empty(), "reduce requires a non-empty responses map");
    match method {
        ConsensusMethod::MajorityVote => majority_vote(responses),
        ConsensusMethod::WeightedConfidence => weighted_confidence(responses),
        ConsensusMethod::ResonancePriority => resonance_priority(responses),
        ConsensusMethod::HarmonicBlend => harmonic_blend(responses),
        ConsensusMethod::XorFiltering => xor_filtering(responses),
        ConsensusMethod::AdaptiveEnsemble => adaptive_ensemble(responses, prompt, state),
        ConsensusMethod::DelegateDiscuss => delegate_discuss(responses),
    }
}

fn pick_with_tiebreak<'a>(
    responses: &'a BTreeMap<NodeId, Response>,
    candidates: impl Iterator<Item = &'a NodeId>,
    tiebreak: impl Fn(&Response, &Response) -> std::cmp::Ordering,
) -> (&'a NodeId, &'a Response) {
    candidates
        .map(|id| (id, &responses[id]))
        .max_by(|(id_a, r_a), (id_b, r_b)| tiebreak(r_a, r_b).then_with(|| id_a.cmp(id_b)))
        .expect("candidates must be non-empty")
}

fn by_resonance_then_confidence(a: &Response, b: &Response) -> std::cmp::Ordering {
    a.resonance
        .partial_cmp(&b.resonance)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
}

fn by_confidence_then_resonance(a: &Response, b: &Response) -> std::cmp::Ordering {
    a.confidence
        .partial_cmp(&b.confidence)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.resonance.partial_cmp(&b.resonance).unwrap_or(std::cmp::Ordering::Equal))
}

fn majority_vote(responses: &BTreeMap<NodeId, Response>) -> ConsensusResult {
    let mut clusters: BTreeMap<&str, Vec<&NodeId>> = BTreeMap::new();
    for (id, r) in responses {
        clusters.entry(r.content.as_str()).or_default().push(id);
    }
    let winning_content = clusters
        .iter()
        .max_by(|(content_a, members_a), (content_b, members_b)| {
            members_a
                .len()
                .cmp(&members_b.len())
                .then_with(|| content_a.cmp(content_b))
        })
        .map(|(content, _)| *content)
        .expect("clusters must be non-empty");
    let members = &clusters[winning_content];
    let (selected_id, selected) =
        pick_with_tiebreak(responses, members.iter().copied(), by_confidence_then_resonance);

    let mut metadata = Map::new();
    metadata.insert("cluster_size".into(), Value::from(members.len()));
    ConsensusResult {
        content: selected.content.clone(),
        selected: Selected::Node(selected_id.clone()),
        confidence: selected.confidence,
        resonance: selected.resonance,
        metadata,
    }
}

fn weighted_confidence(responses: &BTreeMap<NodeId, Response>) -> ConsensusResult {
    let (id, r) = pick_with_tiebreak(responses, responses.keys(), by_confidence_then_resonance);
    ConsensusResult {
        content: r.content.clone(),
        selected: Selected::Node(id.clone()),
        confidence: r.confidence,
        resonance: r.resonance,
        metadata: Map::new(),
    }
}

fn resonance_priority(responses: &BTreeMap<NodeId, Response>) -> ConsensusResult {
    let (id, r) = pick_with_tiebreak(responses, responses.keys(), by_resonance_then_confidence);
    ConsensusResult {
        content: r.content.clone(),
        selected: Selected::Node(id.clone()),
        confidence: r.confidence,
        resonance: r.resonance,
        metadata: Map::new(),
    }
}

fn harmonic_blend(responses: &BTreeMap<NodeId, Response>) -> ConsensusResult {
    let (_, skeleton) = pick_with_tiebreak(responses, responses.keys(), by_resonance_then_confidence);
    let mut per_peer = Map::new();
    for (id, r) in responses {
        per_peer.insert(id.to_string(), Value::from(r.resonance));
    }
    let mut metadata = Map::new();
    metadata.insert("per_peer_resonance".into(), Value::Object(per_peer));

    let avg_confidence = responses.values().map(|r| r.confidence).sum::<f64>() / responses.len() as f64;
    ConsensusResult {
        content: skeleton.content.clone(),
        selected: Selected::Blend,
        confidence: avg_confidence,
        resonance: skeleton.resonance,
        metadata,
    }
}

fn tokenize(content: &str) -> std::collections::HashSet<&str> {
    content.split_whitespace().collect()
}

fn jaccard_overlap(a: &str, b: &str) -> f64 {
    let ta = tokenize(a);
    let tb = tokenize(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let intersection = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

fn xor_filtering(responses: &BTreeMap<NodeId, Response>) -> ConsensusResult {
    let ids: Vec<&NodeId> = responses.keys().collect();
    let scored: Vec<(&NodeId, &Response, f64)> = ids
        .iter()
        .map(|&id| {
            let r = &responses[id];
            let others: Vec<&NodeId> = ids.iter().copied().filter(|&o| o != id).collect();
            let uniqueness = if others.is_empty() {
                1.0
            } else {
                let mean_overlap = others
                    .iter()
                    .map(|&o| jaccard_overlap(&r.content, &responses[o].content))
                    .sum::<f64>()
                    / others.len() as f64;
                1.0 - mean_overlap
            };
            let score = XOR_ALPHA_CONFIDENCE * r.confidence
                + XOR_BETA_RESONANCE * r.resonance
                + XOR_GAMMA_UNIQUENESS * uniqueness;
            (id, r, score)
        })
        .collect();

    let (id, r, _) = scored
        .iter()
        .max_by(|(id_a, a, score_a), (id_b, b, score_b)| {
            score_a
                .partial_cmp(score_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.resonance.partial_cmp(&b.resonance).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| id_a.cmp(id_b))
        })
        .expect("scored must be non-empty");

    ConsensusResult {
        content: r.content.clone(),
        selected: Selected::Node((*id).clone()),
        confidence: r.confidence,
        resonance: r.resonance,
        metadata: Map::new(),
    }
}

fn adaptive_ensemble(
    responses: &BTreeMap<NodeId, Response>,
    prompt: &str,
    state: Option<&mut AdaptiveEnsembleState>,
) -> ConsensusResult {
    let Some(state) = state else {
        return weighted_confidence(responses);
    };
    if state.history.is_empty() {
        for (id, r) in responses {
            state.observe(id, prompt, r.confidence, r.resonance);
        }
        return weighted_confidence(responses);
    }

    let scored: Vec<(&NodeId, &Response, f64)> = responses
        .iter()
        .map(|(id, r)| {
            let observed = r.confidence;
            let predicted = state.predicted(id, prompt).map(|(c, _)| c).unwrap_or(observed);
            let score = ADAPTIVE_BLEND_DELTA * observed + (1.0 - ADAPTIVE_BLEND_DELTA) * predicted;
            (id, r, score)
        })
        .collect();

    let (id, r, _) = scored
        .iter()
        .max_by(|(id_a, a, score_a), (id_b, b, score_b)| {
            score_a
                .partial_cmp(score_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.resonance.partial_cmp(&b.resonance).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| id_a.cmp(id_b))
        })
        .expect("scored must be non-empty");

    for (id, r) in responses {
        state.observe(id, prompt, r.confidence, r.resonance);
    }

    ConsensusResult {
        content: r.content.clone(),
        selected: Selected::Node((*id).clone()),
        confidence: r.confidence,
        resonance: r.resonance,
        metadata: Map::new(),
    }
}

fn delegate_discuss(responses: &BTreeMap<NodeId, Response>) -> ConsensusResult {
    let codec = FftCodec::new(DEFAULT_DIMENSION);
    let ids: Vec<&NodeId> = responses.keys().collect();
    let vectors: BTreeMap<&NodeId, crate::vector::ContentVector> = ids
        .iter()
        .map(|&id| (id, codec.embed_text(&responses[id].content)))
        .collect();

    let mut tally: BTreeMap<&NodeId, f64> = BTreeMap::new();
    for &id in &ids {
        let others: Vec<&&NodeId> = ids.iter().filter(|&&o| o != id).collect();
        if others.is_empty() {
            *tally.entry(id).or_insert(0.0) += responses[id].confidence;
            continue;
        }
        let target = others
            .iter()
            .map(|&&o| (o, vectors[id].cosine_similarity(&vectors[o])))
            .max_by(|(id_a, sim_a), (id_b, sim_b)| {
                sim_a
                    .partial_cmp(sim_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| id_a.cmp(id_b))
            })
            .map(|(o, _)| o)
            .expect("others must be non-empty");
        *tally.entry(target).or_insert(0.0) += responses[id].confidence;
    }

    let total_weight: f64 = tally.values().sum();
    let (winner, winner_weight) = tally
        .iter()
        .max_by(|(id_a, w_a), (id_b, w_b)| {
            w_a.partial_cmp(w_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    responses[*id_a]
                        .resonance
                        .partial_cmp(&responses[*id_b].resonance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| id_a.cmp(id_b))
        })
        .map(|(id, w)| (*id, *w))
        .expect("tally must be non-empty");

    let majority_ratio = if total_weight > 0.0 {
        winner_weight / total_weight
    } else {
        0.0
    };

    let winner_response = &responses[winner];
    let mut metadata = Map::new();
    metadata.insert(
        "majority_ratio".into(),
        Value::from(majority_ratio),
    );
    ConsensusResult {
        content: winner_response.content.clone(),
        selected: Selected::Node(winner.clone()),
        confidence: winner_response.confidence,
        resonance: winner_response.resonance,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(content: &str, confidence: f64, resonance: f64) -> Response {
        Response {
            content: content.into(),
            model_id: "test-model".into(),
            confidence,
            resonance,
            consent_verified: true,
        }
    }

    fn two_peer_map() -> BTreeMap<NodeId, Response> {
        let mut map = BTreeMap::new();
        map.insert(NodeId::from("a"), r("X", 0.6, 0.5));
        map.insert(NodeId::from("b"), r("Y", 0.9, 0.8));
        map
    }

    #[test]
    fn weighted_confidence_picks_higher_confidence_peer() {
        let responses = two_peer_map();
        let result = reduce(ConsensusMethod::WeightedConfidence, &responses, "q", None);
        assert_eq!(result.content, "Y");
        assert_eq!(result.selected, Selected::Node(NodeId::from("b")));
    }

    #[test]
    fn resonance_priority_picks_higher_resonance_peer() {
        let responses = two_peer_map();
        let result = reduce(ConsensusMethod::ResonancePriority, &responses, "q", None);
        assert_eq!(result.content, "Y");
    }

    #[test]
    fn majority_vote_picks_larger_cluster() {
        let mut responses = BTreeMap::new();
        responses.insert(NodeId::from("a"), r("same", 0.5, 0.4));
        responses.insert(NodeId::from("b"), r("same", 0.6, 0.4));
        responses.insert(NodeId::from("c"), r("different", 0.99, 0.99));
        let result = reduce(ConsensusMethod::MajorityVote, &responses, "q", None);
        assert_eq!(result.content, "same");
    }

    #[test]
    fn majority_vote_within_tied_cluster_prefers_higher_confidence() {
        let mut responses = BTreeMap::new();
        responses.insert(NodeId::from("a"), r("same", 0.9, 0.1));
        responses.insert(NodeId::from("b"), r("same", 0.2, 0.8));
        let result = reduce(ConsensusMethod::MajorityVote, &responses, "q", None);
        assert_eq!(result.selected, Selected::Node(NodeId::from("a")));
        assert_eq!(result.confidence, 0.9);
    }

    #[test]
    fn is_deterministic_across_repeated_calls() {
        let responses = two_peer_map();
        let a = reduce(ConsensusMethod::XorFiltering, &responses, "q", None);
        let b = reduce(ConsensusMethod::XorFiltering, &responses, "q", None);
        assert_eq!(a, b);
    }

    #[test]
    fn adaptive_ensemble_falls_back_without_history() {
        let responses = two_peer_map();
        let result = reduce(ConsensusMethod::AdaptiveEnsemble, &responses, "q", None);
        assert_eq!(result.content, "Y");
    }

    #[test]
    fn adaptive_ensemble_uses_threaded_state_across_calls() {
        let responses = two_peer_map();
        let mut state = AdaptiveEnsembleState::new();
        let _ = reduce(
            ConsensusMethod::AdaptiveEnsemble,
            &responses,
            "q",
            Some(&mut state),
        );
        assert!(!state.history.is_empty());
        let second = reduce(
            ConsensusMethod::AdaptiveEnsemble,
            &responses,
            "q",
            Some(&mut state),
        );
        assert_eq!(second.content, "Y");
    }

    #[test]
    fn delegate_discuss_reports_majority_ratio() {
        let responses = two_peer_map();
        let result = reduce(ConsensusMethod::DelegateDiscuss, &responses, "q", None);
        assert!(result.metadata.contains_key("majority_ratio"));
    }

    #[test]
    fn harmonic_blend_selected_is_blend() {
        let responses = two_peer_map();
        let result = reduce(ConsensusMethod::HarmonicBlend, &responses, "q", None);
        assert_eq!(result.selected, Selected::Blend);
    }
}
