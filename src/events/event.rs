//! # Immutable events routed by the [`Bus`](crate::Bus).
//!
//! An [`Event`] is a named record with a JSON-object payload, the identifier of
//! its producer and an optional [`CorrelationKey`] that routes results back to
//! the right job and sub-unit.
//!
//! Events are built with chained `with_*` calls and are immutable afterwards:
//! fields are only reachable through accessors, and the payload is shared
//! behind an `Arc` so cloning an event never copies it.
//!
//! ## Ordering
//! Each event gets a globally unique sequence number (`seq`) at construction.
//! Events built by one producer therefore carry increasing sequence numbers.
//!
//! ## Example
//! ```rust
//! use pipevisor::{CorrelationKey, Event};
//! use serde_json::json;
//!
//! let ev = Event::new("WorkRequested", "orchestrator")
//!     .with_field("kind", json!("prices"))
//!     .with_field("args", json!({ "symbol": "eth" }))
//!     .with_correlation(CorrelationKey::sub_unit("1h", "eth"));
//!
//! assert_eq!(ev.name(), "WorkRequested");
//! assert_eq!(ev.str_field("kind"), Some("prices"));
//! assert_eq!(ev.correlation_key().and_then(|k| k.unit()), Some("eth"));
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Field map carried by every event.
pub type Payload = Map<String, Value>;

/// Routes a result to a job stage: its sub-unit discovery, its reference or
/// one of its sub-units.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationKey {
    job: Arc<str>,
    target: Target,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Target {
    Plan,
    Reference,
    Unit(Arc<str>),
}

impl CorrelationKey {
    /// Key addressing the work that discovers the sub-units of `job`.
    pub fn plan(job: impl Into<Arc<str>>) -> Self {
        Self {
            job: job.into(),
            target: Target::Plan,
        }
    }

    /// Key addressing the reference result of `job`.
    pub fn reference(job: impl Into<Arc<str>>) -> Self {
        Self {
            job: job.into(),
            target: Target::Reference,
        }
    }

    /// Key addressing sub-unit `unit` of `job`.
    pub fn sub_unit(job: impl Into<Arc<str>>, unit: impl Into<Arc<str>>) -> Self {
        Self {
            job: job.into(),
            target: Target::Unit(unit.into()),
        }
    }

    /// Job id.
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Sub-unit id; `None` for the reference and plan keys.
    pub fn unit(&self) -> Option<&str> {
        match &self.target {
            Target::Unit(unit) => Some(unit),
            Target::Plan | Target::Reference => None,
        }
    }

    /// True when the key addresses the job's reference work.
    pub fn is_reference(&self) -> bool {
        self.target == Target::Reference
    }

    /// True when the key addresses the job's sub-unit discovery.
    pub fn is_plan(&self) -> bool {
        self.target == Target::Plan
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Unit(unit) => write!(f, "{}/{}", self.job, unit),
            Target::Reference => write!(f, "{}/@reference", self.job),
            Target::Plan => write!(f, "{}/@plan", self.job),
        }
    }
}

/// Named, immutable record published on the bus.
#[derive(Clone)]
pub struct Event {
    seq: u64,
    at: SystemTime,
    name: Arc<str>,
    producer: Arc<str>,
    payload: Arc<Payload>,
    correlation_key: Option<CorrelationKey>,
}

impl Event {
    /// Creates an event with an empty payload, the current timestamp and the next sequence number.
    pub fn new(name: impl Into<Arc<str>>, producer: impl Into<Arc<str>>) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            name: name.into(),
            producer: producer.into(),
            payload: Arc::new(Payload::new()),
            correlation_key: None,
        }
    }

    /// Sets one payload field.
    #[inline]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        Arc::make_mut(&mut self.payload).insert(key.into(), value);
        self
    }

    /// Replaces the whole payload.
    #[inline]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Arc::new(payload);
        self
    }

    /// Attaches a correlation key.
    #[inline]
    pub fn with_correlation(mut self, key: CorrelationKey) -> Self {
        self.correlation_key = Some(key);
        self
    }

    /// Globally unique, monotonically increasing sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wall-clock construction time.
    pub fn at(&self) -> SystemTime {
        self.at
    }

    /// Event name (matches a registered schema).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier of the component that built the event.
    pub fn producer(&self) -> &str {
        &self.producer
    }

    /// Payload fields.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Correlation key, if any.
    pub fn correlation_key(&self) -> Option<&CorrelationKey> {
        self.correlation_key.as_ref()
    }

    /// Raw payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Payload field as a string slice.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("seq", &self.seq)
            .field("name", &self.name)
            .field("producer", &self.producer)
            .field("correlation_key", &self.correlation_key)
            .field("payload", &self.payload)
            .finish()
    }
}
