//! # Orchestrator: drives one run from start to shutdown.
//!
//! The [`Orchestrator`] owns the bus dispatcher, the agents and the receiving
//! end of the [`Session`](crate::Session). It wires the run together, waits for
//! the session to finish (or for an OS signal) and tears everything down in
//! reverse start order.
//!
//! ## Lifecycle
//! ```text
//! run() / run_until(signal):
//!   publish ConfigBroadcast { run_id, parameters }
//!   start agents (registration order)
//!   spawn bus dispatcher
//!   publish RunRequested { run_id }         ──► Session seeds WorkRequested
//!
//!   wait for the first of:
//!     ├─ Session: PresentationDone after FinalResultsReady  → Finished
//!     ├─ shutdown signal                                     → Interrupted
//!     └─ dispatcher exited early                             → BusClosed
//!
//!   stop agents in reverse start order
//!     ├─ Finished:    agent_stop_timeout each
//!     └─ Interrupted: shared deadline of cfg.grace
//!   bus.shutdown(), join dispatcher
//!
//!   Finished                         → Ok(RunReport { final_results: Some(..) })
//!   Interrupted, all drained         → Ok(RunReport { final_results: None })
//!   Interrupted, some force-stopped  → Err(GraceExceeded { stuck })
//! ```

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::agent::{ManagedAgent, StopReport};
use crate::core::builder::OrchestratorBuilder;
use crate::core::shutdown;
use crate::error::RuntimeError;
use crate::events::{Bus, Diagnostic, Dispatcher, contract};
use crate::pipeline::{FinalResults, SESSION};

/// Summary of a finished run.
#[derive(Debug)]
pub struct RunReport {
    /// Run identifier broadcast in `ConfigBroadcast`.
    pub run_id: String,
    /// Final results; `None` when the run was interrupted.
    pub final_results: Option<FinalResults>,
    /// One report per agent, in stop order (reverse start order).
    pub agents: Vec<StopReport>,
    /// Events dispatched by the bus.
    pub dispatched: u64,
    /// Diagnostics recorded during the run.
    pub diagnostics: Vec<Diagnostic>,
}

enum Ending {
    Finished(FinalResults),
    Interrupted(&'static str),
    SignalFailed(std::io::Error),
    BusClosed,
}

/// Drives one pipeline run.
pub struct Orchestrator {
    pub(crate) cfg: Config,
    pub(crate) bus: Bus,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) run_id: String,
    pub(crate) parameters: Value,
    pub(crate) agents: Vec<Box<dyn ManagedAgent>>,
    pub(crate) done: oneshot::Receiver<FinalResults>,
}

impl Orchestrator {
    /// Starts building an orchestrator with `cfg`.
    pub fn builder(cfg: Config) -> OrchestratorBuilder {
        OrchestratorBuilder::new(cfg)
    }

    /// The run's bus.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// The run identifier.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Runs until the session finishes or the process receives a termination signal.
    pub async fn run(self) -> Result<RunReport, RuntimeError> {
        self.run_until(shutdown::wait_for_shutdown_signal()).await
    }

    /// Runs until the session finishes or `shutdown` resolves.
    ///
    /// `shutdown` names the reason for the interruption; an `Err` from it stops
    /// the run and is returned as [`RuntimeError::Signal`].
    pub async fn run_until<F>(self, shutdown: F) -> Result<RunReport, RuntimeError>
    where
        F: Future<Output = std::io::Result<&'static str>>,
    {
        let Orchestrator {
            cfg,
            bus,
            dispatcher,
            run_id,
            parameters,
            mut agents,
            done,
        } = self;

        info!(run = %run_id, agents = agents.len(), "run starting");
        bus.publish(contract::config_broadcast(SESSION, &run_id, parameters));
        for agent in agents.iter_mut() {
            agent.start();
        }
        let mut dispatch = dispatcher.spawn();
        bus.publish(contract::run_requested(SESSION, &run_id));

        let mut dispatched: Option<u64> = None;
        let ending = tokio::select! {
            res = done => match res {
                Ok(results) => Ending::Finished(results),
                Err(_) => Ending::BusClosed,
            },
            sig = shutdown => match sig {
                Ok(name) => Ending::Interrupted(name),
                Err(e) => Ending::SignalFailed(e),
            },
            res = &mut dispatch => {
                dispatched = Some(res.unwrap_or_default());
                Ending::BusClosed
            }
        };

        let reports = match &ending {
            Ending::Interrupted(signal) => {
                warn!(run = %run_id, %signal, grace_ms = cfg.grace.as_millis() as u64, "shutdown requested");
                stop_agents(&mut agents, Budget::Deadline(Instant::now() + cfg.grace)).await
            }
            _ => stop_agents(&mut agents, Budget::Each(cfg.agent_stop_timeout)).await,
        };

        bus.shutdown();
        let dispatched = match dispatched {
            Some(n) => n,
            None => dispatch.await.unwrap_or_else(|e| {
                error!("bus dispatcher crashed: {e}");
                0
            }),
        };

        let final_results = match ending {
            Ending::Finished(results) => {
                info!(run = %run_id, results = results.result_count(), dispatched, "run finished");
                Some(results)
            }
            Ending::Interrupted(_) => {
                let stuck: Vec<String> = reports
                    .iter()
                    .filter(|r| !r.drained)
                    .map(|r| r.agent.clone())
                    .collect();
                if !stuck.is_empty() {
                    error!(run = %run_id, ?stuck, "grace exceeded");
                    return Err(RuntimeError::GraceExceeded {
                        grace: cfg.grace,
                        stuck,
                    });
                }
                info!(run = %run_id, "all agents stopped within grace");
                None
            }
            Ending::SignalFailed(e) => return Err(RuntimeError::Signal(e)),
            Ending::BusClosed => {
                error!(run = %run_id, "bus dispatcher exited before the run finished");
                return Err(RuntimeError::BusClosed);
            }
        };

        Ok(RunReport {
            run_id,
            final_results,
            agents: reports,
            dispatched,
            diagnostics: bus.diagnostics().snapshot(),
        })
    }
}

enum Budget {
    Each(Duration),
    Deadline(Instant),
}

async fn stop_agents(agents: &mut [Box<dyn ManagedAgent>], budget: Budget) -> Vec<StopReport> {
    let mut reports = Vec::with_capacity(agents.len());
    for agent in agents.iter_mut().rev() {
        let timeout = match budget {
            Budget::Each(d) => d,
            Budget::Deadline(at) => at.saturating_duration_since(Instant::now()),
        };
        reports.push(agent.stop(timeout).await);
    }
    reports
}
