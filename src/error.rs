//! Error types used by the pipevisor runtime, its agents and jobs.
//!
//! This module defines four error enums:
//!
//! - [`ValidationError`]: a message was rejected before reaching the bus.
//! - [`WorkError`]: an agent operation failed (transient, permanent or fatal).
//! - [`JobError`]: an invalid transition was attempted on a [`Job`](crate::Job).
//! - [`RuntimeError`]: errors raised by the orchestration runtime itself.
//!
//! All types provide `as_label` (stable snake_case) for logging.

use std::time::Duration;
use thiserror::Error;

use crate::events::FieldShape;

/// # Errors produced while validating an event against its schema.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A schema is already registered under this event name.
    #[error("schema already registered for event '{event}'")]
    DuplicateSchema {
        /// Event name.
        event: String,
    },

    /// No schema is registered under this event name.
    #[error("unknown event name '{event}'")]
    UnknownEventName {
        /// Event name.
        event: String,
    },

    /// A required field is missing or has the wrong shape.
    #[error("event '{event}': field '{field}' must be {expected}")]
    SchemaMismatch {
        /// Event name.
        event: String,
        /// Offending field.
        field: String,
        /// Expected shape.
        expected: FieldShape,
    },

    /// The schema requires a correlation key and none was attached.
    #[error("event '{event}' requires a correlation key")]
    MissingCorrelationKey {
        /// Event name.
        event: String,
    },
}

impl ValidationError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use pipevisor::ValidationError;
    ///
    /// let err = ValidationError::UnknownEventName { event: "Nope".into() };
    /// assert_eq!(err.as_label(), "unknown_event_name");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            ValidationError::DuplicateSchema { .. } => "duplicate_schema",
            ValidationError::UnknownEventName { .. } => "unknown_event_name",
            ValidationError::SchemaMismatch { .. } => "schema_mismatch",
            ValidationError::MissingCorrelationKey { .. } => "missing_correlation_key",
        }
    }

    /// Event name the error refers to.
    pub fn event(&self) -> &str {
        match self {
            ValidationError::DuplicateSchema { event }
            | ValidationError::UnknownEventName { event }
            | ValidationError::SchemaMismatch { event, .. }
            | ValidationError::MissingCorrelationKey { event } => event,
        }
    }
}

/// # Errors produced by agent operations.
///
/// Only [`WorkError::Transient`] and [`WorkError::Timeout`] are retried.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkError {
    /// Retryable external failure (network, rate limit, ...).
    #[error("transient failure: {error}")]
    Transient {
        /// The underlying error message.
        error: String,
    },

    /// Operation exceeded the configured per-operation timeout.
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Non-retryable failure for this operation only.
    #[error("permanent failure: {error}")]
    Permanent {
        /// The underlying error message.
        error: String,
    },

    /// The agent's resource is unusable; the agent degrades.
    #[error("agent fatal error: {error}")]
    Fatal {
        /// The underlying error message.
        error: String,
    },

    /// Operation was cancelled by a forced stop.
    #[error("operation cancelled")]
    Canceled,
}

impl WorkError {
    /// Shorthand for [`WorkError::Transient`].
    pub fn transient(error: impl Into<String>) -> Self {
        WorkError::Transient {
            error: error.into(),
        }
    }

    /// Shorthand for [`WorkError::Permanent`].
    pub fn permanent(error: impl Into<String>) -> Self {
        WorkError::Permanent {
            error: error.into(),
        }
    }

    /// Shorthand for [`WorkError::Fatal`].
    pub fn fatal(error: impl Into<String>) -> Self {
        WorkError::Fatal {
            error: error.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use pipevisor::WorkError;
    ///
    /// assert_eq!(WorkError::transient("503").as_label(), "work_transient");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            WorkError::Transient { .. } => "work_transient",
            WorkError::Timeout { .. } => "work_timeout",
            WorkError::Permanent { .. } => "work_permanent",
            WorkError::Fatal { .. } => "work_fatal",
            WorkError::Canceled => "work_canceled",
        }
    }

    /// Indicates whether the error is safe to retry.
    ///
    /// # Example
    /// ```
    /// use pipevisor::WorkError;
    ///
    /// assert!(WorkError::transient("boom").is_retryable());
    /// assert!(!WorkError::permanent("nope").is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkError::Transient { .. } | WorkError::Timeout { .. })
    }

    /// True for [`WorkError::Fatal`].
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkError::Fatal { .. })
    }
}

/// # Invalid transitions on a job.
///
/// These are programming errors: a correct orchestrator never produces them.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// The job is already completed; it accepts no further mutation.
    #[error("job '{job}' is already completed")]
    Completed {
        /// Job id.
        job: String,
    },

    /// The sub-unit is not part of this job.
    #[error("job '{job}': unknown sub-unit '{unit}'")]
    UnknownSubUnit {
        /// Job id.
        job: String,
        /// Sub-unit id.
        unit: String,
    },

    /// The sub-unit was already resolved.
    #[error("job '{job}': sub-unit '{unit}' already resolved")]
    AlreadyResolved {
        /// Job id.
        job: String,
        /// Sub-unit id.
        unit: String,
    },

    /// The sub-unit's prerequisite was already delivered.
    #[error("job '{job}': prerequisite for '{unit}' delivered twice")]
    DuplicatePrerequisite {
        /// Job id.
        job: String,
        /// Sub-unit id.
        unit: String,
    },

    /// The reference result was already delivered.
    #[error("job '{job}': reference delivered twice")]
    DuplicateReference {
        /// Job id.
        job: String,
    },

    /// The job's sub-units were already planned.
    #[error("job '{job}': sub-units planned twice")]
    AlreadyPlanned {
        /// Job id.
        job: String,
    },
}

impl JobError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            JobError::Completed { .. } => "job_completed",
            JobError::UnknownSubUnit { .. } => "job_unknown_sub_unit",
            JobError::AlreadyResolved { .. } => "job_already_resolved",
            JobError::DuplicatePrerequisite { .. } => "job_duplicate_prerequisite",
            JobError::DuplicateReference { .. } => "job_duplicate_reference",
            JobError::AlreadyPlanned { .. } => "job_already_planned",
        }
    }
}

/// # Errors produced by the pipevisor runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded; some agents had to be force-stopped.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}; forcing termination")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Agents that did not drain in time.
        stuck: Vec<String>,
    },

    /// The bus dispatch task ended before the run finished.
    #[error("bus dispatch loop terminated before the run completed")]
    BusClosed,

    /// Registering the session's handlers failed.
    #[error("session setup failed: {0}")]
    Setup(#[from] ValidationError),

    /// Listening for OS signals failed.
    #[error("signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use pipevisor::RuntimeError;
    /// use std::time::Duration;
    ///
    /// let err = RuntimeError::GraceExceeded { grace: Duration::from_secs(5), stuck: vec![] };
    /// assert_eq!(err.as_label(), "runtime_grace_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
            RuntimeError::BusClosed => "runtime_bus_closed",
            RuntimeError::Setup(_) => "runtime_setup",
            RuntimeError::Signal(_) => "runtime_signal",
        }
    }
}
