//! Local health awareness score (Lifeguard extension, spec §4.6). Scales
//! probe interval and probe timeout by how unhealthy the local node has
//! recently appeared to itself — timeouts and missed probes push the score
//! up, clean round trips bring it back down.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Bounded health score in `[0, max)`. Grounded on the same
/// clamped-atomic-counter shape as the teacher's
/// `networking::health::aggregator` module, generalized to the single
/// scalar Lifeguard actually uses.
pub struct Awareness {
    max: i64,
    score: AtomicI64,
}

impl Awareness {
    pub fn new(max: i64) -> Self {
        Self {
            max: max.max(0),
            score: AtomicI64::new(0),
        }
    }

    pub fn score(&self) -> i64 {
        self.score.load(Ordering::Relaxed)
    }

    /// Applies `delta` (negative improves health, positive degrades it),
    /// clamped to `[0, max]`.
    pub fn apply_delta(&self, delta: i64) {
        let mut current = self.score.load(Ordering::Relaxed);
        loop {
            let next = (current + delta).clamp(0, self.max);
            match self.score.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Scales `base` by `1 + score`, used to stretch probe interval and
    /// probe timeout as awareness worsens.
    pub fn scale_timeout(&self, base: Duration) -> Duration {
        let factor = 1 + self.score();
        base.saturating_mul(factor.max(1) as u32)
    }
}

impl Default for Awareness {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_clamps_to_bounds() {
        let a = Awareness::new(4);
        a.apply_delta(-10);
        assert_eq!(a.score(), 0);
        a.apply_delta(100);
        assert_eq!(a.score(), 4);
    }

    #[test]
    fn scale_timeout_grows_with_score() {
        let a = Awareness::new(8);
        let base = Duration::from_millis(500);
        assert_eq!(a.scale_timeout(base), base);
        a.apply_delta(3);
        assert_eq!(a.scale_timeout(base), base * 4);
    }
}
