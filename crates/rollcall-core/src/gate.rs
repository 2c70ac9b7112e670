//! Per-track cooldown between expensive liveness + identity evaluations.

use crate::tracker::Track;
use std::time::{Duration, Instant};

pub const DEFAULT_TRACK_COOLDOWN: Duration = Duration::from_millis(750);

/// Bounds classifier calls to roughly one per track per cooldown window,
/// independent of frame rate.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationGate {
    cooldown: Duration,
}

impl Default for EvaluationGate {
    fn default() -> Self {
        Self::new(DEFAULT_TRACK_COOLDOWN)
    }
}

impl EvaluationGate {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// True if the track was never evaluated or its cooldown has elapsed.
    pub fn should_evaluate(&self, track: &Track, now: Instant) -> bool {
        match track.last_eval {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.cooldown,
        }
    }
}
