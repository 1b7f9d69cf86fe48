//! Retry policies.
//!
//! This module groups the knobs that control **whether** a failed operation is
//! re-run and **how long** an agent pauses in between.
//!
//! ## Contents
//! - [`RetryPolicy`]   attempt cap for retryable failures
//! - [`BackoffPolicy`] how pauses evolve (first / factor / max + jitter)
//! - [`JitterPolicy`]  randomization strategy to avoid synchronized retries
//!
//! ## Quick wiring
//! ```text
//! Config { retry: RetryPolicy { max_attempts, backoff }, .. }
//!      └─► core::agent uses:
//!           - retry.should_retry(attempt, &err) to decide retry/give up
//!           - retry.backoff.next(failures) to schedule the next attempt
//! ```
//!
//! ## Defaults
//! - `RetryPolicy::default()` → 4 attempts.
//! - `BackoffPolicy::default()` → first=2s, factor=2.5, max=30s, jitter=None.

mod backoff;
mod jitter;
mod retry;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
pub use retry::RetryPolicy;
