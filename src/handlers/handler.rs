//! # Bus handler trait and function-backed handler.
//!
//! [`Handler`] is the extension point for reacting to events. Handlers are owned
//! by the bus dispatch loop and invoked with `&mut self`, one at a time, in
//! subscription order. State kept inside a handler is therefore mutated by a
//! single writer and needs no lock.
//!
//! ## Contract
//! - Handlers **must** return quickly. Anything slow is submitted to an
//!   [`Agent`](crate::Agent) and the handler returns.
//! - An `Err` or a panic is caught by the bus, logged and recorded; it never
//!   affects other subscribers of the same event.
//!
//! ## Example
//! ```rust
//! use pipevisor::{Bus, Event, FnHandler, Handler};
//!
//! let mut seen = 0u32;
//! let _h = FnHandler::new("counter", move |_ev: &Event, _bus: &Bus| {
//!     seen += 1;
//!     Ok(())
//! });
//! ```

use std::borrow::Cow;

use crate::events::{Bus, Event};

/// Contract for bus handlers.
pub trait Handler: Send + 'static {
    /// Human-readable name (for logs and diagnostics).
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Reacts to one event. `bus` may be used to publish follow-up events.
    fn handle(&mut self, event: &Event, bus: &Bus) -> anyhow::Result<()>;
}

/// Function-backed handler.
///
/// Wraps a closure `FnMut(&Event, &Bus) -> anyhow::Result<()>`; captured state
/// lives in the closure and is owned by the dispatch loop.
pub struct FnHandler<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F> FnHandler<F>
where
    F: FnMut(&Event, &Bus) -> anyhow::Result<()> + Send + 'static,
{
    /// Creates a new function-backed handler.
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Handler for FnHandler<F>
where
    F: FnMut(&Event, &Bus) -> anyhow::Result<()> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&mut self, event: &Event, bus: &Bus) -> anyhow::Result<()> {
        (self.f)(event, bus)
    }
}
