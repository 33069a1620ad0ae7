//! `Telemetry` — the observability port called for by REDESIGN FLAGS §9's
//! Metrics/Log requirement: counters for ingress drops by reason, a
//! consensus-latency histogram keyed by `ConsensusMethod`. No global
//! mutable state — every caller holds its own `Arc<dyn Telemetry>`. The
//! default implementation logs through `tracing` with structured fields,
//! the same style as `transport.rs`'s `handle_swarm_event` and the
//! teacher's `swarm_p2p.rs`, and keeps an in-process snapshot so the status
//! API can report counts without a separate metrics backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    InvalidUtf8,
    Malformed,
    SelfAddressed,
    Duplicate,
    Expired,
    InvalidSignature,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::InvalidUtf8 => "invalid_utf8",
            DropReason::Malformed => "malformed",
            DropReason::SelfAddressed => "self_addressed",
            DropReason::Duplicate => "duplicate",
            DropReason::Expired => "expired",
            DropReason::InvalidSignature => "invalid_signature",
        }
    }

    const COUNT: usize = 6;

    fn index(self) -> usize {
        self as usize
    }
}

/// Observability port: drop counters plus a per-method consensus-latency
/// histogram.
pub trait Telemetry: Send + Sync {
    fn record_drop(&self, reason: DropReason);
    fn record_consensus_latency(&self, method: &str, elapsed: Duration);
}

#[derive(Debug, Default)]
struct LatencyStats {
    count: u64,
    total_secs: f64,
    max_secs: f64,
}

/// Default `Telemetry`: every event is logged through `tracing`, and also
/// folded into in-process counters for a bounded, closed set of drop
/// reasons and consensus methods.
pub struct TracingTelemetry {
    drops: [AtomicU64; DropReason::COUNT],
    latency: Mutex<HashMap<String, LatencyStats>>,
}

impl TracingTelemetry {
    pub fn new() -> Self {
        Self {
            drops: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            latency: Mutex::new(HashMap::new()),
        }
    }

    pub fn drop_count(&self, reason: DropReason) -> u64 {
        self.drops[reason.index()].load(Ordering::Relaxed)
    }

    pub fn consensus_latency_avg_secs(&self, method: &str) -> Option<f64> {
        let latency = self.latency.lock().expect("latency mutex poisoned");
        latency.get(method).map(|s| s.total_secs / s.count as f64)
    }
}

impl Default for TracingTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry for TracingTelemetry {
    fn record_drop(&self, reason: DropReason) {
        self.drops[reason.index()].fetch_add(1, Ordering::Relaxed);
        warn!(reason = reason.as_str(), "ingress message dropped");
    }

    fn record_consensus_latency(&self, method: &str, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        {
            let mut latency = self.latency.lock().expect("latency mutex poisoned");
            let stats = latency.entry(method.to_string()).or_default();
            stats.count += 1;
            stats.total_secs += secs;
            stats.max_secs = stats.max_secs.max(secs);
        }
        info!(method, latency_secs = secs, "consensus request resolved");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_drops_by_reason() {
        let t = TracingTelemetry::new();
        t.record_drop(DropReason::Duplicate);
        t.record_drop(DropReason::Duplicate);
        t.record_drop(DropReason::Expired);
        assert_eq!(t.drop_count(DropReason::Duplicate), 2);
        assert_eq!(t.drop_count(DropReason::Expired), 1);
        assert_eq!(t.drop_count(DropReason::Malformed), 0);
    }

    #[test]
    fn tracks_consensus_latency_average() {
        let t = TracingTelemetry::new();
        t.record_consensus_latency("weighted_confidence", Duration::from_millis(100));
        t.record_consensus_latency("weighted_confidence", Duration::from_millis(300));
        let avg = t.consensus_latency_avg_secs("weighted_confidence").unwrap();
        assert!((avg - 0.2).abs() < 1e-9);
    }
}
