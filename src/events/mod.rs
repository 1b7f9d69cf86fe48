//! Events: data model, schemas and the ordered bus.
//!
//! This module groups the event **data model**, the **validator** gating the
//! bus, the **bus** itself and the pipeline **contracts**.
//!
//! ## Contents
//! - [`Event`], [`CorrelationKey`] immutable records and result routing
//! - [`Schema`], [`FieldShape`], [`Validator`] per-name payload contracts
//! - [`Bus`], [`Dispatcher`] ordered, single-consumer dispatch
//! - [`Diagnostics`] out-of-band record of rejected events and handler failures
//! - [`contract`] names and constructors of the pipeline events
//!
//! ## Quick reference
//! - **Publishers**: the orchestrator's session handler, agents (results,
//!   failures, degradation), the presentation agent.
//! - **Consumers**: handlers registered on the bus (session, agent inboxes,
//!   [`LogWriter`](crate::LogWriter)).

mod bus;
pub mod contract;
mod diagnostics;
mod event;
mod schema;

pub use bus::{Bus, Dispatcher, HandlerId};
pub use diagnostics::{DEFAULT_DIAGNOSTICS_CAPACITY, Diagnostic, Diagnostics};
pub use event::{CorrelationKey, Event, Payload};
pub use schema::{FieldShape, Schema, Validator};
