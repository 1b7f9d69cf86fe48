//! # LogWriter: pipeline event printer
//!
//! A handler that turns pipeline events into `tracing` records. Subscribe it
//! with [`LogWriter::subscribe`] to get a readable trace of a run.
//!
//! ## Example output
//! ```text
//! INFO  [config] run="4f0c…" producer="orchestrator"
//! INFO  [run-requested] run="4f0c…"
//! DEBUG [work-requested] key=1h/eth kind="prices"
//! DEBUG [work-completed] key=1h/eth kind="prices" producer="fetch"
//! WARN  [work-failed] key=1h/doge kind="prices" cause="symbol not listed"
//! INFO  [job-completed] job="1h" results=2 failures=1
//! INFO  [final-results] run="4f0c…" results=4 failures=2
//! ERROR [agent-degraded] agent="store" kinds=["persist"] cause="disk full"
//! INFO  [presentation-done]
//! ```

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::ValidationError;
use crate::events::contract::*;
use crate::events::{Bus, Event, HandlerId};
use crate::handlers::Handler;

/// Event writer handler.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Registers a writer on `bus` for every pipeline event.
    pub fn subscribe(bus: &Bus) -> Result<HandlerId, ValidationError> {
        bus.subscribe_many(
            &[
                CONFIG_BROADCAST,
                RUN_REQUESTED,
                WORK_REQUESTED,
                WORK_COMPLETED,
                WORK_FAILED,
                JOB_COMPLETED,
                FINAL_RESULTS_READY,
                PRESENTATION_DONE,
                AGENT_DEGRADED,
            ],
            Self::new(),
        )
    }
}

fn len_of(e: &Event, field: &str) -> usize {
    e.field(field).and_then(Value::as_array).map_or(0, Vec::len)
}

impl Handler for LogWriter {
    fn name(&self) -> &str {
        "log-writer"
    }

    fn handle(&mut self, e: &Event, _bus: &Bus) -> anyhow::Result<()> {
        let key = e
            .correlation_key()
            .map(ToString::to_string)
            .unwrap_or_default();

        match e.name() {
            CONFIG_BROADCAST => {
                info!(run = ?e.str_field("run_id"), producer = %e.producer(), "[config]");
            }
            RUN_REQUESTED => {
                info!(run = ?e.str_field("run_id"), "[run-requested]");
            }
            WORK_REQUESTED => {
                debug!(%key, kind = ?e.str_field("kind"), "[work-requested]");
            }
            WORK_COMPLETED => {
                debug!(%key, kind = ?e.str_field("kind"), producer = %e.producer(), "[work-completed]");
            }
            WORK_FAILED => {
                warn!(
                    %key,
                    kind = ?e.str_field("kind"),
                    cause = ?e.str_field("cause"),
                    "[work-failed]"
                );
            }
            JOB_COMPLETED => {
                info!(
                    job = ?e.str_field("job_id"),
                    results = len_of(e, "results"),
                    failures = len_of(e, "failures"),
                    "[job-completed]"
                );
            }
            FINAL_RESULTS_READY => {
                info!(
                    run = ?e.str_field("run_id"),
                    results = len_of(e, "results"),
                    failures = len_of(e, "failures"),
                    "[final-results]"
                );
            }
            AGENT_DEGRADED => {
                error!(
                    agent = ?e.str_field("agent"),
                    kinds = ?e.field("kinds"),
                    cause = ?e.str_field("cause"),
                    "[agent-degraded]"
                );
            }
            PRESENTATION_DONE => {
                info!("[presentation-done]");
            }
            other => {
                debug!(event = %other, producer = %e.producer(), seq = e.seq(), "[event]");
            }
        }
        Ok(())
    }
}

/// Installs a global `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already set.
#[cfg(feature = "logging")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
