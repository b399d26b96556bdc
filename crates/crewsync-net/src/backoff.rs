use std::cmp;
use std::time::Duration;

use rand::Rng;

use crewsync_shared::constants::{
    DEFAULT_RECONNECT_BASE_MS, DEFAULT_RECONNECT_MAX_MS, RECONNECT_JITTER,
};

/// Capped exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay applied as random +/- jitter. `0.0` disables it.
    pub jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: RECONNECT_JITTER,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        let raw = self.base.saturating_mul(factor);
        let capped = cmp::min(raw, self.max);

        if self.jitter <= 0.0 {
            return capped;
        }

        let spread = capped.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let jittered = (capped.as_secs_f64() + offset).max(0.0);
        cmp::min(Duration::from_secs_f64(jittered), self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
        )
    }
}
