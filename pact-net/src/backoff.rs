// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::time::Duration;

use rand::Rng;

/// Exponential reconnect backoff: `min(max, base * 2^failures)` with symmetric jitter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the nominal delay, applied as +/- jitter.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt, without jitter.
    pub fn nominal(&self, consecutive_failures: u32) -> Duration {
        let factor = 1u32.checked_shl(consecutive_failures.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Jittered delay, never above `max`.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let nominal = self.nominal(consecutive_failures);
        if self.jitter <= 0.0 || nominal.is_zero() {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(1.0 + spread).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_doubles_until_cap() {
        let b = Backoff::default();
        assert_eq!(b.nominal(0), Duration::from_secs(1));
        assert_eq!(b.nominal(1), Duration::from_secs(2));
        assert_eq!(b.nominal(5), Duration::from_secs(32));
        assert_eq!(b.nominal(6), Duration::from_secs(60));
        assert_eq!(b.nominal(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let b = Backoff::default();
        for _ in 0..200 {
            let d = b.delay(2);
            assert!(d >= Duration::from_millis(3200), "{d:?}");
            assert!(d <= Duration::from_millis(4800), "{d:?}");
            assert!(b.delay(20) <= b.max);
        }
    }

    #[test]
    fn test_no_jitter() {
        let b = Backoff::new(Duration::from_millis(10), Duration::from_secs(1)).with_jitter(0.0);
        assert_eq!(b.delay(3), Duration::from_millis(80));
    }
}
