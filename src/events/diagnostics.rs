//! # Out-of-band record of bus failures.
//!
//! `publish` is fire-and-forget, so a rejected event or a failing handler
//! cannot report back to the caller. Each such failure is logged and recorded
//! here exactly once; tests and operators read it via [`Diagnostics::snapshot`].
//!
//! The log keeps the most recent [`Diagnostics::capacity`] entries; older ones
//! are evicted. Per-label totals ([`Diagnostics::count`]) cover every entry
//! ever recorded.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::error::ValidationError;

/// One recorded bus failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// An event was rejected by the validator and dropped.
    Rejected {
        /// Producer of the dropped event.
        producer: String,
        /// Validation failure.
        error: ValidationError,
    },
    /// A handler returned an error.
    HandlerFailed {
        /// Handler name.
        handler: String,
        /// Event being dispatched.
        event: String,
        /// Error message.
        error: String,
    },
    /// A handler panicked.
    HandlerPanicked {
        /// Handler name.
        handler: String,
        /// Event being dispatched.
        event: String,
        /// Panic message.
        info: String,
    },
    /// A handler exceeded the watchdog threshold.
    SlowHandler {
        /// Handler name.
        handler: String,
        /// Event being dispatched.
        event: String,
        /// Elapsed time in milliseconds.
        elapsed_ms: u64,
    },
}

impl Diagnostic {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Diagnostic::Rejected { .. } => "event_rejected",
            Diagnostic::HandlerFailed { .. } => "handler_failed",
            Diagnostic::HandlerPanicked { .. } => "handler_panicked",
            Diagnostic::SlowHandler { .. } => "handler_slow",
        }
    }
}

/// Default number of retained entries.
pub const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Log {
    recent: VecDeque<Diagnostic>,
    totals: HashMap<&'static str, u64>,
}

/// Shared, bounded diagnostics log. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    capacity: usize,
    log: Arc<Mutex<Log>>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DIAGNOSTICS_CAPACITY)
    }
}

impl Diagnostics {
    /// Creates an empty log retaining [`DEFAULT_DIAGNOSTICS_CAPACITY`] entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty log retaining at most `capacity` entries (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            log: Arc::default(),
        }
    }

    /// Maximum number of retained entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends one entry, evicting the oldest when full.
    pub fn record(&self, diagnostic: Diagnostic) {
        let mut log = self.lock();
        *log.totals.entry(diagnostic.as_label()).or_default() += 1;
        if log.recent.len() == self.capacity {
            log.recent.pop_front();
        }
        log.recent.push_back(diagnostic);
    }

    /// Copy of the retained entries, oldest first.
    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.lock().recent.iter().cloned().collect()
    }

    /// Number of entries ever recorded with the given label, evicted ones included.
    pub fn count(&self, label: &str) -> usize {
        self.lock().totals.get(label).map_or(0, |n| *n as usize)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Log> {
        // A poisoned log is still a valid record.
        self.log.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slow(handler: &str) -> Diagnostic {
        Diagnostic::SlowHandler {
            handler: handler.to_string(),
            event: "Tick".to_string(),
            elapsed_ms: 150,
        }
    }

    #[test]
    fn keeps_the_most_recent_entries_and_counts_all() {
        let diagnostics = Diagnostics::with_capacity(2);
        for handler in ["a", "b", "c"] {
            diagnostics.record(slow(handler));
        }
        diagnostics.record(Diagnostic::HandlerFailed {
            handler: "d".to_string(),
            event: "Tick".to_string(),
            error: "boom".to_string(),
        });

        let kept: Vec<_> = diagnostics.snapshot().iter().map(Diagnostic::as_label).collect();
        assert_eq!(kept, vec!["handler_slow", "handler_failed"]);
        assert_eq!(diagnostics.snapshot()[0], slow("c"));
        assert_eq!(diagnostics.count("handler_slow"), 3);
        assert_eq!(diagnostics.count("handler_failed"), 1);
        assert_eq!(diagnostics.count("event_rejected"), 0);
    }

    #[test]
    fn zero_capacity_still_keeps_the_last_entry() {
        let diagnostics = Diagnostics::with_capacity(0);
        diagnostics.record(slow("a"));
        diagnostics.record(slow("b"));
        assert_eq!(diagnostics.snapshot(), vec![slow("b")]);
    }
}
