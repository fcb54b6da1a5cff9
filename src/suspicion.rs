//! Self-accelerating suspicion timer (Lifeguard extension, spec §4.6): the
//! longer a suspicion goes unconfirmed, the slower the timeout decays toward
//! its minimum; each independent peer that also suspects the same node
//! speeds it back up. Grounded on the same multi-tier timeout-scheduling
//! shape as `networking::health::detector`, adapted to the specific
//! `min/max/k` formula Lifeguard defines.

use std::time::{Duration, Instant};

/// A single node's outstanding suspicion, tracking how many distinct peers
/// have independently corroborated it.
pub struct SuspicionTimer {
    min: Duration,
    max: Duration,
    /// Number of independent confirmations expected before `min` is reached.
    k: u32,
    confirmations: u32,
    from: std::collections::HashSet<crate::common::Name>,
    start: Instant,
}

impl SuspicionTimer {
    pub fn new(min: Duration, max: Duration, k: u32) -> Self {
        Self {
            min,
            max,
            k,
            confirmations: 0,
            from: std::collections::HashSet::new(),
            start: Instant::now(),
        }
    }

    /// Records an additional independent suspicion report from `reporter`.
    /// Duplicate reports from the same peer do not accelerate the timer.
    pub fn confirm(&mut self, reporter: crate::common::Name) {
        if self.from.insert(reporter) {
            self.confirmations = self.confirmations.saturating_add(1);
        }
    }

    /// Timeout for the next check, per Lifeguard's formula:
    /// `max - (max - min) * log(confirmations + 1) / log(k + 1)`, floored at
    /// `min`. With zero confirmations this returns `max`.
    pub fn timeout(&self) -> Duration {
        if self.k == 0 || self.confirmations == 0 {
            return self.max;
        }
        let frac = ((self.confirmations as f64) + 1.0).ln() / ((self.k as f64) + 1.0).ln();
        let frac = frac.min(1.0);
        let span = self.max.as_secs_f64() - self.min.as_secs_f64();
        let secs = self.max.as_secs_f64() - span * frac;
        Duration::from_secs_f64(secs.max(self.min.as_secs_f64()))
    }

    /// Whether this suspicion's current (confirmation-scaled) timeout has
    /// elapsed as of `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.start) >= self.timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Name;

    #[test]
    fn zero_confirmations_uses_max() {
        let t = SuspicionTimer::new(Duration::from_secs(1), Duration::from_secs(10), 3);
        assert_eq!(t.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn more_confirmations_shrink_timeout() {
        let mut t = SuspicionTimer::new(Duration::from_secs(1), Duration::from_secs(10), 3);
        let before = t.timeout();
        t.confirm(Name::new("a").unwrap());
        t.confirm(Name::new("b").unwrap());
        let after = t.timeout();
        assert!(after < before);
        assert!(after >= Duration::from_secs(1));
    }

    #[test]
    fn duplicate_reporter_does_not_double_count() {
        let mut t = SuspicionTimer::new(Duration::from_secs(1), Duration::from_secs(10), 3);
        t.confirm(Name::new("a").unwrap());
        let once = t.timeout();
        t.confirm(Name::new("a").unwrap());
        let twice = t.timeout();
        assert_eq!(once, twice);
    }

    #[test]
    fn not_expired_before_min_elapses() {
        let t = SuspicionTimer::new(Duration::from_millis(200), Duration::from_secs(10), 3);
        assert!(!t.is_expired(Instant::now()));
    }

    #[test]
    fn expired_once_min_elapses_with_full_confirmation() {
        let mut t = SuspicionTimer::new(Duration::from_millis(1), Duration::from_millis(50), 2);
        t.confirm(Name::new("a").unwrap());
        t.confirm(Name::new("b").unwrap());
        std::thread::sleep(Duration::from_millis(5));
        assert!(t.is_expired(Instant::now()));
    }
}
