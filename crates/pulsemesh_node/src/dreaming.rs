//! Idle-time dream cadence.
//!
//! Spec.md is silent on *when* a node should call `store_dream`; it only
//! defines what happens once one is called (§4.6). Grounded on the
//! teacher's `DreamingManager` idle-detection shape (`Instant`/`Duration`
//! tracked activity, `should_dream`/`record_activity`/`reset_idle`), with
//! its ML-specific weight-validation logic dropped — there is no model
//! training in this crate, only a cadence decision the federation
//! coordinator consults on each tick.

use std::time::{Duration, Instant};

pub struct DreamScheduler {
    last_activity: Instant,
    idle_threshold: Duration,
    dream_count: u64,
}

impl DreamScheduler {
    pub fn new(idle_threshold: Duration) -> Self {
        Self {
            last_activity: Instant::now(),
            idle_threshold,
            dream_count: 0,
        }
    }

    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn should_dream(&self) -> bool {
        self.last_activity.elapsed() >= self.idle_threshold
    }

    pub fn dream_count(&self) -> u64 {
        self.dream_count
    }

    /// Call once a dream has actually been generated and stored; resets the
    /// idle clock so the next dream waits a full threshold again.
    pub fn mark_dreamed(&mut self) {
        self.dream_count += 1;
        self.last_activity = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn does_not_dream_immediately_after_construction() {
        let scheduler = DreamScheduler::new(Duration::from_secs(60));
        assert!(!scheduler.should_dream());
    }

    #[test]
    fn dreams_once_idle_threshold_elapses() {
        let scheduler = DreamScheduler::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(scheduler.should_dream());
    }

    #[test]
    fn mark_dreamed_resets_idle_clock_and_increments_count() {
        let mut scheduler = DreamScheduler::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(scheduler.should_dream());
        scheduler.mark_dreamed();
        assert_eq!(scheduler.dream_count(), 1);
        assert!(!scheduler.should_dream());
    }
}
