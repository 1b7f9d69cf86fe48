use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::core::agent::{Agent, ManagedAgent, Worker};
use crate::core::orchestrator::Orchestrator;
use crate::error::RuntimeError;
use crate::events::{Bus, Diagnostics, Dispatcher, Validator};
use crate::handlers::LogWriter;
use crate::pipeline::{AnalysisParams, JobPlan, Joiner, Session};

/// Builder for an [`Orchestrator`].
///
/// The bus exists as soon as the builder does, so agents can be created
/// against [`bus`](Self::bus) and subscribed before they are added.
pub struct OrchestratorBuilder {
    cfg: Config,
    bus: Bus,
    dispatcher: Dispatcher,
    run_id: String,
    parameters: Value,
    plans: Vec<JobPlan>,
    agents: Vec<Box<dyn ManagedAgent>>,
    log_events: bool,
}

impl OrchestratorBuilder {
    /// Creates a builder with a bus gated by every pipeline contract.
    ///
    /// The run id defaults to a fresh UUID v4.
    pub fn new(cfg: Config) -> Self {
        let diagnostics = Diagnostics::with_capacity(cfg.diagnostics_capacity);
        let (bus, dispatcher) = Bus::with_diagnostics(Validator::with_contracts(), diagnostics);
        let dispatcher = dispatcher.with_watchdog(cfg.handler_warn_threshold);
        Self {
            cfg,
            bus,
            dispatcher,
            run_id: uuid::Uuid::new_v4().to_string(),
            parameters: AnalysisParams::default().to_value(),
            plans: Vec::new(),
            agents: Vec::new(),
            log_events: false,
        }
    }

    /// The bus the run will use.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Configuration handed to the orchestrator.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Overrides the generated run id.
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Sets the parameters broadcast in `ConfigBroadcast`.
    pub fn parameters(mut self, params: &AnalysisParams) -> Self {
        self.parameters = params.to_value();
        self
    }

    /// Adds one job to the plan.
    pub fn job(mut self, plan: JobPlan) -> Self {
        self.plans.push(plan);
        self
    }

    /// Adds several jobs to the plan.
    pub fn jobs(mut self, plans: impl IntoIterator<Item = JobPlan>) -> Self {
        self.plans.extend(plans);
        self
    }

    /// Adds an agent. Agents start in the order added and stop in reverse.
    pub fn agent<W: Worker>(mut self, agent: Agent<W>) -> Self {
        debug!(agent = %agent.name(), "agent registered");
        self.agents.push(Box::new(agent));
        self
    }

    /// Subscribes a [`LogWriter`] to every pipeline event.
    pub fn with_log_writer(mut self) -> Self {
        self.log_events = true;
        self
    }

    /// Creates the session with `joiner` and returns the orchestrator.
    pub fn build<J>(self, joiner: J) -> Result<Orchestrator, RuntimeError>
    where
        J: Joiner<Value, Value> + Send + 'static,
    {
        if self.log_events {
            LogWriter::subscribe(&self.bus)?;
        }
        let (session, done) = Session::new(self.run_id.clone(), self.plans, joiner);
        session.subscribe(&self.bus)?;

        Ok(Orchestrator {
            cfg: self.cfg,
            bus: self.bus,
            dispatcher: self.dispatcher,
            run_id: self.run_id,
            parameters: self.parameters,
            agents: self.agents,
            done,
        })
    }
}
