//! # Backoff between retries of a transient failure.
//!
//! [`BackoffPolicy`] computes the pause an agent takes before re-running an
//! operation that failed with a retryable [`WorkError`](crate::WorkError):
//! - [`BackoffPolicy::first`] the pause after the first failed attempt;
//! - [`BackoffPolicy::factor`] the multiplicative growth per further failure;
//! - [`BackoffPolicy::max`] the cap.
//!
//! The pause after failure `n` (0-indexed) is `first × factor^n`, clamped to
//! `max`, then jittered. The base is derived from `n` alone, so jitter output
//! never feeds back into later pauses.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use pipevisor::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_secs(2),
//!     max: Duration::from_secs(30),
//!     factor: 2.5,
//!     jitter: JitterPolicy::None,
//! };
//!
//! assert_eq!(backoff.next(0), Duration::from_secs(2));
//! assert_eq!(backoff.next(1), Duration::from_secs(5));
//! assert_eq!(backoff.next(3), Duration::from_secs(30)); // 31.25s capped
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::policies::jitter::JitterPolicy;

/// Retry backoff policy.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Pause after the first failed attempt.
    #[serde(rename = "first_ms", with = "duration_ms")]
    pub first: Duration,
    /// Maximum pause.
    #[serde(rename = "max_ms", with = "duration_ms")]
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub factor: f64,
    /// Randomization applied to every pause.
    #[serde(default)]
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Returns a policy with:
    /// - `first = 2s`;
    /// - `factor = 2.5` (2s, 5s, 12.5s, ...);
    /// - `max = 30s`;
    /// - no jitter.
    fn default() -> Self {
        Self {
            first: Duration::from_secs(2),
            max: Duration::from_secs(30),
            factor: 2.5,
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    /// Constant pause of `delay`, handy in tests.
    pub fn constant(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Computes the pause following failure number `failure` (0-indexed).
    ///
    /// # Notes
    /// - `factor == 1.0` keeps the pause constant at `first` (up to `max`).
    /// - Non-finite or negative intermediate values clamp to `max`.
    pub fn next(&self, failure: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = failure.min(i32::MAX as u32) as i32;
        let unclamped = self.first.as_secs_f64() * self.factor.powi(exp);

        let base = if !unclamped.is_finite() || unclamped < 0.0 || unclamped > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(unclamped)
        };

        match self.jitter {
            JitterPolicy::Decorrelated => {
                self.jitter
                    .apply_decorrelated(self.first.min(self.max), base, self.max)
            }
            _ => self.jitter.apply(base),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(first_ms: u64, max_ms: u64, factor: f64, jitter: JitterPolicy) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(first_ms),
            max: Duration::from_millis(max_ms),
            factor,
            jitter,
        }
    }

    #[test]
    fn default_schedule_grows_and_caps() {
        let p = BackoffPolicy::default();
        let schedule: Vec<_> = (0..5).map(|n| p.next(n)).collect();
        assert_eq!(
            schedule,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_millis(12_500),
                Duration::from_secs(30),
                Duration::from_secs(30),
            ]
        );
    }

    #[test]
    fn constant_policy_never_grows() {
        let p = BackoffPolicy::constant(Duration::from_millis(500));
        for n in 0..10 {
            assert_eq!(p.next(n), Duration::from_millis(500));
        }
    }

    #[test]
    fn first_above_max_is_clamped() {
        let p = policy(10_000, 5_000, 2.0, JitterPolicy::None);
        assert_eq!(p.next(0), Duration::from_secs(5));
    }

    #[test]
    fn overflow_clamps_to_max() {
        let p = policy(100, 10_000, 2.0, JitterPolicy::None);
        assert_eq!(p.next(100), Duration::from_secs(10));
        assert_eq!(p.next(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn full_jitter_stays_below_base() {
        let p = policy(100, 30_000, 2.0, JitterPolicy::Full);
        for n in 0..12 {
            let base = Duration::from_millis(100 * 2u64.pow(n)).min(Duration::from_secs(30));
            assert!(p.next(n) <= base, "failure {n}");
        }
    }

    #[test]
    fn equal_jitter_keeps_half_of_base() {
        let p = policy(1_000, 30_000, 1.0, JitterPolicy::Equal);
        for n in 0..50 {
            let d = p.next(n);
            assert!(d >= Duration::from_millis(500));
            assert!(d <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn decorrelated_jitter_respects_floor() {
        let p = policy(100, 30_000, 2.0, JitterPolicy::Decorrelated);
        for _ in 0..100 {
            assert!(p.next(8) >= Duration::from_millis(100));
        }
    }

    #[test]
    fn deserializes_from_milliseconds() {
        let p: BackoffPolicy =
            serde_json::from_str(r#"{ "first_ms": 250, "max_ms": 1000, "factor": 2.0 }"#).unwrap();
        assert_eq!(p.first, Duration::from_millis(250));
        assert_eq!(p.jitter, JitterPolicy::None);
        assert_eq!(p.next(3), Duration::from_secs(1));
    }
}
