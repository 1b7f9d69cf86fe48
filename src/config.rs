//! # Global runtime configuration.
//!
//! [`Config`] centralizes the runtime settings of the orchestrator, its bus and
//! its agents: shutdown grace, agent drain timeout, queue poll interval, the
//! handler watchdog threshold, per-operation timeout, the retry policy and the
//! number of retained bus diagnostics.
//!
//! ## Sentinel values
//! - `task_timeout = 0s` → no per-operation timeout
//! - `handler_warn_threshold = 0s` → watchdog disabled
//!
//! ## Loading
//! Durations are (de)serialized as integer milliseconds; missing keys keep
//! their defaults:
//! ```
//! use std::time::Duration;
//! use pipevisor::Config;
//!
//! let cfg = Config::from_json_str(r#"{ "grace_ms": 5000, "retry": { "max_attempts": 2 } }"#).unwrap();
//! assert_eq!(cfg.grace, Duration::from_secs(5));
//! assert_eq!(cfg.retry.max_attempts, 2);
//! assert_eq!(cfg.poll_interval, Duration::from_secs(1));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::events::DEFAULT_DIAGNOSTICS_CAPACITY;
use crate::policies::RetryPolicy;

/// Global configuration for the orchestrator runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum wait for agents to drain after an OS shutdown signal.
    ///
    /// Agents still busy afterwards are force-stopped and reported in
    /// `RuntimeError::GraceExceeded`.
    #[serde(rename = "grace_ms", with = "duration_ms")]
    pub grace: Duration,

    /// Drain timeout handed to `Agent::stop` at the end of a normal run.
    #[serde(rename = "agent_stop_timeout_ms", with = "duration_ms")]
    pub agent_stop_timeout: Duration,

    /// Upper bound on how long an idle agent waits before re-checking its stop flag.
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,

    /// Handlers running longer than this are logged as stalling the bus.
    ///
    /// - `Duration::ZERO` = watchdog disabled
    #[serde(rename = "handler_warn_threshold_ms", with = "duration_ms")]
    pub handler_warn_threshold: Duration,

    /// Per-operation timeout inside agents.
    ///
    /// - `Duration::ZERO` = no timeout
    /// - `> 0` = a slower attempt fails with `WorkError::Timeout` (retryable)
    #[serde(rename = "task_timeout_ms", with = "duration_ms")]
    pub task_timeout: Duration,

    /// Retry policy for transient failures.
    pub retry: RetryPolicy,

    /// Number of bus diagnostics retained; older entries are evicted.
    pub diagnostics_capacity: usize,
}

impl Config {
    /// Parses a JSON document; absent keys keep their defaults.
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Returns the per-operation timeout as an `Option`.
    #[inline]
    pub fn operation_timeout(&self) -> Option<Duration> {
        (self.task_timeout > Duration::ZERO).then_some(self.task_timeout)
    }

    /// Poll interval clamped to at least one millisecond.
    #[inline]
    pub fn poll_interval_clamped(&self) -> Duration {
        self.poll_interval.max(Duration::from_millis(1))
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `grace = 30s`
    /// - `agent_stop_timeout = 10s`
    /// - `poll_interval = 1s`
    /// - `handler_warn_threshold = 100ms`
    /// - `task_timeout = 0s` (no timeout)
    /// - `retry = RetryPolicy::default()` (4 attempts, 2s × 2.5 up to 30s)
    /// - `diagnostics_capacity = 1024`
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
            agent_stop_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            handler_warn_threshold: Duration::from_millis(100),
            task_timeout: Duration::ZERO,
            retry: RetryPolicy::default(),
            diagnostics_capacity: DEFAULT_DIAGNOSTICS_CAPACITY,
        }
    }
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
