//! # Jitter applied to retry pauses.
//!
//! Several agents hitting the same rate-limited provider tend to fail together
//! and, without randomization, retry together. [`JitterPolicy`] spreads them:
//!
//! - [`JitterPolicy::None`] exact pause
//! - [`JitterPolicy::Full`] uniform in `[0, pause]`
//! - [`JitterPolicy::Equal`] `pause/2 + uniform[0, pause/2]`
//! - [`JitterPolicy::Decorrelated`] uniform in `[first, 3 × pause]`, capped at `max`

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Randomization strategy for retry pauses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterPolicy {
    /// Exact pause; predictable, used in tests.
    #[default]
    None,
    /// Uniform in `[0, pause]`.
    Full,
    /// Half the pause plus uniform in `[0, pause/2]`.
    Equal,
    /// Uniform in `[first, 3 × pause]`, capped; needs [`apply_decorrelated`](Self::apply_decorrelated).
    Decorrelated,
}

impl JitterPolicy {
    /// Applies jitter to `delay`.
    ///
    /// `Decorrelated` returns `delay` unchanged here; it needs the extra
    /// bounds taken by [`apply_decorrelated`](Self::apply_decorrelated).
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            JitterPolicy::None | JitterPolicy::Decorrelated => delay,
            JitterPolicy::Full => full(delay),
            JitterPolicy::Equal => equal(delay),
        }
    }

    /// Decorrelated jitter between `floor` and `min(3 × prev, max)`.
    ///
    /// Other policies fall back to [`apply`](Self::apply) on `prev`.
    pub fn apply_decorrelated(&self, floor: Duration, prev: Duration, max: Duration) -> Duration {
        if !matches!(self, JitterPolicy::Decorrelated) {
            return self.apply(prev);
        }

        let floor_ms = floor.as_millis() as u64;
        let upper = (prev.as_millis() as u64)
            .saturating_mul(3)
            .min(max.as_millis() as u64)
            .max(floor_ms);

        if floor_ms >= upper {
            return floor;
        }
        Duration::from_millis(rand::rng().random_range(floor_ms..=upper))
    }
}

fn full(delay: Duration) -> Duration {
    let ms = delay.as_millis() as u64;
    if ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=ms))
}

fn equal(delay: Duration) -> Duration {
    let half = delay.as_millis() as u64 / 2;
    if half == 0 {
        return delay;
    }
    Duration::from_millis(half + rand::rng().random_range(0..=half))
}
