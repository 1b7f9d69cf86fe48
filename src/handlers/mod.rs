//! # Bus handlers.
//!
//! - [`Handler`] the trait every bus subscriber implements;
//! - [`FnHandler`] wraps a closure;
//! - [`LogWriter`] prints pipeline events through `tracing`.

mod handler;
mod log;

pub use handler::{FnHandler, Handler};
#[cfg(feature = "logging")]
pub use log::init_tracing;
pub use log::LogWriter;
