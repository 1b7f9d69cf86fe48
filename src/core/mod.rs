//! Runtime core: agents, orchestration and lifecycle.
//!
//! - [`agent`]: worker behind a FIFO with retry, degraded mode and drain/force stop;
//! - [`runner`]: executes one attempt with timeout and cancellation;
//! - [`orchestrator`]: wires a run together and tears it down;
//! - [`builder`]: assembles an orchestrator;
//! - [`shutdown`]: cross-platform shutdown signal handling.

mod agent;
mod builder;
mod orchestrator;
mod runner;
mod shutdown;

pub use agent::{Agent, AgentHandle, ManagedAgent, StopReport, WorkContext, Worker};
pub use builder::OrchestratorBuilder;
pub use orchestrator::{Orchestrator, RunReport};
pub use shutdown::wait_for_shutdown_signal;
