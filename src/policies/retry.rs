//! # Retry policy for transient work failures.
//!
//! [`RetryPolicy`] bounds how often an [`Agent`](crate::Agent) re-runs an
//! operation that failed with a retryable [`WorkError`](crate::WorkError):
//!
//! ```text
//! attempt 1 ──► Transient ──► pause next(0) ──► attempt 2 ──► ...
//!                                                  │
//!   attempt max_attempts ──► Transient ──► give up: failure hook (WorkFailed)
//!   any attempt          ──► Permanent ──► give up immediately
//!   any attempt          ──► Fatal     ──► agent degrades
//! ```
//!
//! With `max_attempts = 4` the operation runs at most four times, pausing
//! three times in between; there is never a fifth attempt.

use serde::{Deserialize, Serialize};

use crate::error::WorkError;
use crate::policies::BackoffPolicy;

/// Attempt cap plus pauses for retryable failures.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first (`0` is treated as `1`).
    pub max_attempts: u32,
    /// Pauses between attempts.
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    /// Four attempts with [`BackoffPolicy::default`].
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retry.
    pub fn never() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Effective attempt cap (at least one).
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// True when attempt number `attempt` (1-based) failing with `err` may be retried.
    pub fn should_retry(&self, attempt: u32, err: &WorkError) -> bool {
        err.is_retryable() && attempt < self.attempts()
    }
}
