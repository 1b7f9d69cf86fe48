//! # pipevisor
//!
//! **Pipevisor** is the orchestration core of a multi-stage analysis pipeline.
//!
//! It provides an ordered event bus, work-queue agents that do the slow work
//! off the bus, and a fan-in job state machine that joins N sub-unit results
//! with one reference result. External collaborators (data fetchers,
//! indicator math, persistence, presentation) plug in as agents and only talk
//! through events.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   ┌──────────────┐      ┌───────────────────────────────────────────────┐
//!   │ Orchestrator │      │  Bus (single dispatch task, strict FIFO)      │
//!   │ ConfigBroad. ├─────►│  validate ─► queue ─► handlers in sub. order  │
//!   │ RunRequested │      └──────┬──────────────────┬──────────────┬──────┘
//!   └──────▲───────┘             ▼                  ▼              ▼
//!          │              ┌────────────┐     ┌────────────┐  ┌──────────┐
//!          │ FinalResults │  Session   │     │ agent inbox│  │LogWriter │
//!          └──────────────┤ Jobs, count│     │ (submit op)│  └──────────┘
//!                         └─────┬──────┘     └─────┬──────┘
//!              WorkRequested ◄──┘                  ▼
//!                                           ┌─────────────┐
//!                                           │ Agent task  │ retry, backoff,
//!                                           │ (FIFO, 1 op │ degraded mode
//!                                           │  at a time) │
//!                                           └──────┬──────┘
//!                                                  │ WorkCompleted / WorkFailed
//!                                                  └──────────► Bus
//! ```
//!
//! ### Single writer
//! Job and session state live inside bus handlers. The dispatcher owns every
//! handler and runs them one at a time, so that state is mutated by a single
//! task and needs no lock. Agents never touch it; they publish events.
//!
//! ## Features
//! | Area              | Description                                                  | Key types / traits                          |
//! |-------------------|--------------------------------------------------------------|---------------------------------------------|
//! | **Events**        | Validated, ordered delivery to owned handlers.               | [`Bus`], [`Event`], [`Validator`], [`Handler`] |
//! | **Agents**        | Serial work queues with retry and drain/force stop.          | [`Agent`], [`Worker`], [`StopReport`]       |
//! | **Jobs**          | Order-independent fan-in with an absorbing completed state.  | [`Job`], [`Joiner`], [`Session`]            |
//! | **Orchestration** | Startup, completion counting, signals, shutdown.             | [`Orchestrator`], [`RunReport`]             |
//! | **Policies**      | Attempt cap, exponential backoff, jitter.                    | [`RetryPolicy`], [`BackoffPolicy`]          |
//! | **Errors**        | Typed errors with stable labels.                             | [`ValidationError`], [`WorkError`], [`JobError`], [`RuntimeError`] |
//! | **Configuration** | Centralized runtime settings, JSON overrides.                | [`Config`], [`AnalysisParams`]              |
//!
//! ## Optional features
//! - `logging`: exports [`init_tracing`], installing a `tracing-subscriber` fmt layer.
//!
//! ## Example
//! ```rust
//! use async_trait::async_trait;
//! use pipevisor::{
//!     Agent, Bus, Config, CorrelationKey, JobPlan, Orchestrator, WorkContext, WorkError, WorkItem, Worker,
//!     contract,
//! };
//! use serde_json::{Value, json};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Worker for Echo {
//!     type Op = (CorrelationKey, String, Value);
//!
//!     fn name(&self) -> &str { "echo" }
//!
//!     async fn execute(&mut self, (key, kind, args): Self::Op, ctx: &WorkContext) -> Result<(), WorkError> {
//!         ctx.bus.publish(contract::work_completed("echo", key, &kind, args));
//!         Ok(())
//!     }
//!
//!     fn on_failed(&mut self, (key, kind, _): &Self::Op, err: &WorkError, bus: &Bus) {
//!         bus.publish(contract::work_failed("echo", key.clone(), kind, &err.to_string()));
//!     }
//! }
//!
//! fn product(_unit: &str, r: &Value, p: &Value) -> Result<Option<Value>, String> {
//!     Ok(Some(json!(r.as_i64().unwrap_or(0) * p.as_i64().unwrap_or(0))))
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let builder = Orchestrator::builder(Config::default())
//!         .job(JobPlan::new("1h", WorkItem::new("echo", json!(2))).sub_unit("eth", WorkItem::new("echo", json!(3))));
//!
//!     let echo = Agent::new(Echo, builder.bus().clone(), Config::default());
//!     echo.listen(contract::WORK_REQUESTED, |ev| {
//!         Some((ev.correlation_key()?.clone(), ev.str_field("kind")?.to_string(), ev.field("args")?.clone()))
//!     })?;
//!     builder.bus().subscribe_fn(contract::FINAL_RESULTS_READY, "presenter", |_ev, bus| {
//!         bus.publish(contract::presentation_done("presenter"));
//!         Ok(())
//!     })?;
//!
//!     let orchestrator = builder
//!         .agent(echo)
//!         .build(product)?;
//!
//!     let report = orchestrator.run().await?;
//!     let results = report.final_results.expect("run finished");
//!     assert_eq!(results.jobs[0].results[0].output, json!(6));
//!     Ok(())
//! }
//! ```

mod config;
mod core;
mod error;
mod events;
mod handlers;
mod pipeline;
mod policies;

// ---- Public re-exports ----

pub use config::Config;
pub use crate::core::{
    Agent, AgentHandle, ManagedAgent, Orchestrator, OrchestratorBuilder, RunReport, StopReport,
    WorkContext, Worker, wait_for_shutdown_signal,
};
pub use error::{JobError, RuntimeError, ValidationError, WorkError};
pub use events::contract;
pub use events::{
    Bus, CorrelationKey, DEFAULT_DIAGNOSTICS_CAPACITY, Diagnostic, Diagnostics, Dispatcher, Event,
    FieldShape, HandlerId, Payload, Schema, Validator,
};
pub use handlers::{FnHandler, Handler, LogWriter};
pub use pipeline::{
    AnalysisParams, Discovery, FinalResults, Job, JobPlan, JobReport, JobState, JoinedResult,
    Joiner, Resolution, SESSION, SESSION_EVENTS, Session, SubUnitState, UnitFailure, WorkItem,
};
pub use policies::{BackoffPolicy, JitterPolicy, RetryPolicy};

// Optional: install a tracing fmt subscriber.
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use handlers::init_tracing;
