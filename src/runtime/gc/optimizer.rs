//! Adaptive GC pacing
//!
//! The optimizer keeps a moving average of observed pause times and nudges
//! an adaptive trigger threshold: up by 10% while pauses run over target
//! (fewer, larger cycles), down by 5% otherwise.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::GarbageCollector;

/// Threshold the optimizer starts from (10MB).
pub const DEFAULT_THRESHOLD: usize = 10 * 1024 * 1024;

/// Snapshot of optimizer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OptimizerStats {
    pub collections: u64,
    pub last_pause: Duration,
    pub avg_pause: Duration,
    pub target_pause: Duration,
    pub threshold: usize,
}

#[derive(Debug)]
struct OptimizerState {
    enabled: bool,
    target_pause: Duration,
    last_pause: Duration,
    avg_pause: Duration,
    collections: u64,
    threshold: usize,
    /// Collector cycle count at the last `optimize` call.
    seen_cycles: u64,
}

/// Tunes a collector's trigger from observed pauses.
#[derive(Debug)]
pub struct GCOptimizer {
    state: Mutex<OptimizerState>,
}

impl GCOptimizer {
    /// Create an enabled optimizer aiming for `target_pause`.
    pub fn new(target_pause: Duration) -> Self {
        Self::with_threshold(target_pause, DEFAULT_THRESHOLD)
    }

    pub fn with_threshold(
        target_pause: Duration,
        threshold: usize,
    ) -> Self {
        Self {
            state: Mutex::new(OptimizerState {
                enabled: true,
                target_pause,
                last_pause: Duration::ZERO,
                avg_pause: Duration::ZERO,
                collections: 0,
                threshold,
                seen_cycles: 0,
            }),
        }
    }

    /// Feed one pause sample and return the adjusted threshold.
    ///
    /// Returns `None` while disabled.
    pub fn record_pause(
        &self,
        pause: Duration,
    ) -> Option<usize> {
        let mut state = self.state.lock();
        if !state.enabled {
            return None;
        }
        state.collections += 1;
        state.last_pause = pause;
        state.avg_pause = (state.avg_pause * 9 + pause) / 10;
        state.threshold = if state.avg_pause > state.target_pause {
            state.threshold * 110 / 100
        } else {
            state.threshold * 95 / 100
        };
        Some(state.threshold)
    }

    /// Observe `gc`'s latest cycle, if there is a new one, and install the
    /// adjusted threshold as its trigger.
    ///
    /// Never starts a collection. Returns the new trigger when one was set.
    pub fn optimize(
        &self,
        gc: &GarbageCollector,
    ) -> Option<usize> {
        let stats = gc.stats();
        {
            let mut state = self.state.lock();
            if !state.enabled || stats.collections == state.seen_cycles {
                return None;
            }
            state.seen_cycles = stats.collections;
        }
        let threshold = self.record_pause(stats.last_pause)?;
        gc.set_trigger_size(threshold);
        debug!(
            threshold,
            pause_us = stats.last_pause.as_micros() as u64,
            "GC trigger adjusted"
        );
        Some(threshold)
    }

    pub fn stats(&self) -> OptimizerStats {
        let state = self.state.lock();
        OptimizerStats {
            collections: state.collections,
            last_pause: state.last_pause,
            avg_pause: state.avg_pause,
            target_pause: state.target_pause,
            threshold: state.threshold,
        }
    }

    pub fn set_target_pause(
        &self,
        target: Duration,
    ) {
        self.state.lock().target_pause = target;
    }

    pub fn enable(&self) {
        self.state.lock().enabled = true;
    }

    pub fn disable(&self) {
        self.state.lock().enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }
}

impl Default for GCOptimizer {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}
