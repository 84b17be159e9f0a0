// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Exponential backoff with jitter, shared by the history tailer and the
//! external-integration poller so the back-off policy is encoded once.

use std::time::Duration;

/// Computes the next poll delay after a successful, non-empty poll, an
/// empty poll, or an error.
///
/// Mirrors the history tailer's scheduling rule: a successful non-empty poll
/// resets to the base interval; an empty poll or error increases an idle
/// streak (capped) and applies `base * 2^idle_streak`, capped at `max_delay`.
/// Jitter is applied multiplicatively within `±jitter_fraction`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    idle_streak: u32,
    max_idle_streak: u32,
    jitter_fraction: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, idle_streak: 0, max_idle_streak: 4, jitter_fraction: 0.35 }
    }

    pub fn with_jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    pub fn with_max_idle_streak(mut self, streak: u32) -> Self {
        self.max_idle_streak = streak;
        self
    }

    /// A productive poll: reset the idle streak, delay is `base` (jittered).
    pub fn on_success(&mut self, jitter_sample: f64) -> Duration {
        self.idle_streak = 0;
        jitter(self.base, self.jitter_fraction, jitter_sample)
    }

    /// An empty poll or a transient error: grow the idle streak and back off.
    pub fn on_idle_or_error(&mut self, jitter_sample: f64) -> Duration {
        self.idle_streak = (self.idle_streak + 1).min(self.max_idle_streak);
        let scaled = self.base.saturating_mul(1u32 << self.idle_streak);
        jitter(scaled.min(self.max), self.jitter_fraction, jitter_sample)
    }

    pub fn idle_streak(&self) -> u32 {
        self.idle_streak
    }
}

/// `jitter_sample` must be a uniform value in `[0.0, 1.0)`; callers supply it
/// (rather than this module sampling `rand` internally) so the scheduling
/// math stays deterministic under test.
fn jitter(d: Duration, fraction: f64, jitter_sample: f64) -> Duration {
    let factor = 1.0 - fraction + (2.0 * fraction * jitter_sample);
    Duration::from_secs_f64((d.as_secs_f64() * factor).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_resets_idle_streak() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        b.on_idle_or_error(0.5);
        b.on_idle_or_error(0.5);
        assert_eq!(b.idle_streak(), 2);
        b.on_success(0.5);
        assert_eq!(b.idle_streak(), 0);
    }

    #[test]
    fn idle_streak_caps_and_backs_off_exponentially() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..10 {
            b.on_idle_or_error(0.5);
        }
        assert_eq!(b.idle_streak(), 4);
    }

    #[test]
    fn delay_is_capped_at_max() {
        let mut b = Backoff::new(Duration::from_secs(30), Duration::from_secs(60));
        let d = b.on_idle_or_error(0.5);
        assert!(d <= Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(10);
        let low = jitter(base, 0.35, 0.0);
        let high = jitter(base, 0.35, 1.0);
        assert!(low.as_secs_f64() >= 6.5 - 0.01);
        assert!(high.as_secs_f64() <= 13.5 + 0.01);
    }
}
