//! # Session: run-level bookkeeping on the bus.
//!
//! A [`Session`] is a bus [`Handler`] owning every [`Job`] of one run. It turns
//! `RunRequested` into `WorkRequested` events, routes `WorkCompleted` /
//! `WorkFailed` results to the right job by correlation key, and counts jobs
//! down to a single `FinalResultsReady`.
//!
//! ```text
//! RunRequested ──► WorkRequested × (1 reference + N sub-units) per job
//!              └─► WorkRequested × (1 reference + 1 discovery) per discovery job
//! WorkCompleted(discovery) ──► Job::plan ──► WorkRequested × N sub-units
//! WorkCompleted / WorkFailed ──► Job ──(completes)──► JobCompleted
//! JobCompleted ──► remaining_jobs -= 1 ──(zero)──► FinalResultsReady (once)
//! AgentDegraded ──► fail in-flight keys of the degraded kinds
//! PresentationDone ──► hand FinalResults to the orchestrator
//! ```
//!
//! Results for keys no longer in flight (already failed, or belonging to a
//! completed job) are stale and ignored. So are results whose `kind` differs
//! from the kind requested for their key; the key stays in flight.
//!
//! ## Discovery
//! A discovery result is a JSON array. A string element names a sub-unit
//! (args `{ "unit": id }`); an object element is `{ unit, args? }`. Malformed
//! elements are skipped. Any other result fails the job's plan.

use std::collections::{HashMap, HashSet};

use anyhow::Context;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::ValidationError;
use crate::events::contract::{
    self, AGENT_DEGRADED, FINAL_RESULTS_READY, JOB_COMPLETED, PRESENTATION_DONE, RUN_REQUESTED,
    WORK_COMPLETED, WORK_FAILED,
};
use crate::events::{Bus, CorrelationKey, Event, HandlerId};
use crate::handlers::Handler;
use crate::pipeline::job::{Job, JobReport, Joiner, SubUnitState};

/// Producer name of events published by the session.
pub const SESSION: &str = "orchestrator";

/// Events a [`Session`] subscribes to.
pub const SESSION_EVENTS: &[&str] = &[
    RUN_REQUESTED,
    WORK_COMPLETED,
    WORK_FAILED,
    JOB_COMPLETED,
    AGENT_DEGRADED,
    PRESENTATION_DONE,
];

/// One piece of work to request from an agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkItem {
    /// Work kind; agents select requests by kind.
    pub kind: String,
    /// Arguments passed through `WorkRequested.args`.
    pub args: Value,
}

impl WorkItem {
    /// Work of `kind` with `args`.
    pub fn new(kind: impl Into<String>, args: Value) -> Self {
        Self {
            kind: kind.into(),
            args,
        }
    }
}

/// Work whose result lists a job's sub-units at run time.
#[derive(Debug, Clone, PartialEq)]
pub struct Discovery {
    /// Discovery work, requested with the job's plan key.
    pub work: WorkItem,
    /// Kind requested for every discovered sub-unit.
    pub unit_kind: String,
}

/// Plan of one job: its reference work and its sub-units.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPlan {
    /// Job id, unique within a run.
    pub id: String,
    /// Work producing the job's reference result.
    pub reference: WorkItem,
    /// Sub-units known up front, in plan order.
    pub sub_units: Vec<(String, WorkItem)>,
    /// Optional run-time discovery of further sub-units.
    pub discovery: Option<Discovery>,
}

impl JobPlan {
    /// Plan for job `id` without sub-units.
    pub fn new(id: impl Into<String>, reference: WorkItem) -> Self {
        Self {
            id: id.into(),
            reference,
            sub_units: Vec::new(),
            discovery: None,
        }
    }

    /// Appends sub-unit `unit`.
    pub fn sub_unit(mut self, unit: impl Into<String>, work: WorkItem) -> Self {
        self.sub_units.push((unit.into(), work));
        self
    }

    /// Discovers sub-units with `work` once the run starts.
    ///
    /// Each discovered sub-unit is requested with `unit_kind`, after the
    /// sub-units listed with [`JobPlan::sub_unit`]. The job does not complete
    /// before discovery does.
    pub fn discover(mut self, work: WorkItem, unit_kind: impl Into<String>) -> Self {
        self.discovery = Some(Discovery {
            work,
            unit_kind: unit_kind.into(),
        });
        self
    }
}

/// Results of a finished run, jobs in plan order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalResults {
    /// Run id.
    pub run_id: String,
    /// One report per job.
    pub jobs: Vec<JobReport<Value>>,
}

impl FinalResults {
    /// Flat `[{ job, unit, output }]` array carried by `FinalResultsReady`.
    pub fn results_value(&self) -> Value {
        Value::Array(
            self.jobs
                .iter()
                .flat_map(|job| {
                    job.results
                        .iter()
                        .map(move |r| json!({ "job": job.job, "unit": r.unit, "output": r.output }))
                })
                .collect(),
        )
    }

    /// Flat `[{ job, unit, cause }]` array carried by `FinalResultsReady`.
    ///
    /// A job-level error is listed first for its job, with a null `unit`.
    pub fn failures_value(&self) -> Value {
        Value::Array(
            self.jobs
                .iter()
                .flat_map(|job| {
                    let error = job
                        .error
                        .iter()
                        .map(move |cause| json!({ "job": job.job, "unit": Value::Null, "cause": cause }));
                    let units = job
                        .failures
                        .iter()
                        .map(move |f| json!({ "job": job.job, "unit": f.unit, "cause": f.cause }));
                    error.chain(units)
                })
                .collect(),
        )
    }

    /// Total accepted outputs over all jobs.
    pub fn result_count(&self) -> usize {
        self.jobs.iter().map(|j| j.results.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Finalized,
    Done,
}

/// Run-level handler owning the jobs of one run.
pub struct Session {
    run_id: String,
    plans: Vec<JobPlan>,
    jobs: Vec<Job<Value, Value>>,
    index: HashMap<String, usize>,
    counted: HashSet<String>,
    joiner: Box<dyn Joiner<Value, Value> + Send>,
    in_flight: HashMap<CorrelationKey, String>,
    remaining_jobs: usize,
    phase: Phase,
    final_results: Option<FinalResults>,
    done: Option<oneshot::Sender<FinalResults>>,
}

impl Session {
    /// Creates a session for `run_id`.
    ///
    /// The receiver yields the final results once presentation is acknowledged.
    /// Plans repeating a job id are skipped.
    pub fn new<J>(
        run_id: impl Into<String>,
        plans: Vec<JobPlan>,
        joiner: J,
    ) -> (Self, oneshot::Receiver<FinalResults>)
    where
        J: Joiner<Value, Value> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut kept = Vec::with_capacity(plans.len());
        let mut jobs = Vec::with_capacity(plans.len());
        let mut index = HashMap::new();

        for plan in plans {
            if index.contains_key(&plan.id) {
                warn!(job = %plan.id, "duplicate job id in plan; skipped");
                continue;
            }
            index.insert(plan.id.clone(), jobs.len());
            jobs.push(match plan.discovery {
                Some(_) => Job::unplanned(plan.id.clone()),
                None => Job::new(plan.id.clone(), plan.sub_units.iter().map(|(u, _)| u.clone())),
            });
            kept.push(plan);
        }

        let session = Self {
            run_id: run_id.into(),
            remaining_jobs: jobs.len(),
            plans: kept,
            jobs,
            index,
            counted: HashSet::new(),
            joiner: Box::new(joiner),
            in_flight: HashMap::new(),
            phase: Phase::Idle,
            final_results: None,
            done: Some(tx),
        };
        (session, rx)
    }

    /// Id of the run this session drives.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Moves the session onto `bus`, subscribed to [`SESSION_EVENTS`].
    pub fn subscribe(self, bus: &Bus) -> Result<HandlerId, ValidationError> {
        bus.subscribe_many(SESSION_EVENTS, self)
    }

    fn on_run_requested(&mut self, event: &Event, bus: &Bus) -> anyhow::Result<()> {
        if event.str_field("run_id") != Some(self.run_id.as_str()) {
            debug!(run = ?event.str_field("run_id"), "run request for another session");
            return Ok(());
        }
        if self.phase != Phase::Idle {
            warn!(run = %self.run_id, "run already started; request ignored");
            return Ok(());
        }
        self.phase = Phase::Running;
        info!(run = %self.run_id, jobs = self.jobs.len(), "run started");

        for plan in &self.plans {
            let id = plan.id.as_str();
            request(&mut self.in_flight, bus, CorrelationKey::reference(id), &plan.reference);
            match &plan.discovery {
                Some(discovery) => {
                    request(&mut self.in_flight, bus, CorrelationKey::plan(id), &discovery.work);
                }
                None => {
                    for (unit, work) in &plan.sub_units {
                        let key = CorrelationKey::sub_unit(id, unit.as_str());
                        request(&mut self.in_flight, bus, key, work);
                    }
                }
            }
        }

        if self.remaining_jobs == 0 {
            self.finalize(bus)?;
        }
        Ok(())
    }

    /// Accepts a result for `key` if it is still in flight under the same kind;
    /// returns the job index.
    fn claim(&mut self, event: &Event) -> anyhow::Result<Option<(CorrelationKey, usize)>> {
        let key = event
            .correlation_key()
            .cloned()
            .with_context(|| format!("{} without correlation key", event.name()))?;
        let kind = event.str_field("kind").unwrap_or_default();

        match self.in_flight.get(&key) {
            None => {
                debug!(%key, event = %event.name(), producer = %event.producer(), "stale result ignored");
                return Ok(None);
            }
            Some(requested) if requested != kind => {
                debug!(
                    %key,
                    requested = %requested,
                    kind = %kind,
                    producer = %event.producer(),
                    "result of another kind ignored"
                );
                return Ok(None);
            }
            Some(_) => {}
        }
        self.in_flight.remove(&key);
        let Some(&job) = self.index.get(key.job()) else {
            warn!(%key, "result for unknown job ignored");
            return Ok(None);
        };
        Ok(Some((key, job)))
    }

    fn on_work_completed(&mut self, event: &Event, bus: &Bus) -> anyhow::Result<()> {
        let Some((key, i)) = self.claim(event)? else {
            return Ok(());
        };
        let result = event.field("result").cloned().unwrap_or(Value::Null);
        if key.is_plan() {
            return self.on_discovered(i, &result, bus);
        }
        let job = &mut self.jobs[i];
        let report = match key.unit() {
            None => job.resolve_reference(result, &mut *self.joiner)?,
            Some(unit) => job.resolve_prerequisite(unit, result, &mut *self.joiner)?,
        };
        self.job_done(report, bus)
    }

    fn on_discovered(&mut self, i: usize, result: &Value, bus: &Bus) -> anyhow::Result<()> {
        let plan = &self.plans[i];
        let Some(discovery) = &plan.discovery else {
            warn!(job = %plan.id, "discovery result for a job without discovery ignored");
            return Ok(());
        };
        let Some(found) = result.as_array() else {
            let report = self.jobs[i].fail_plan("discovery result is not an array")?;
            return self.job_done(Some(report), bus);
        };

        let mut units = plan.sub_units.clone();
        for entry in found {
            match discovered_unit(entry, &discovery.unit_kind) {
                Some(unit) => units.push(unit),
                None => warn!(job = %plan.id, %entry, "malformed discovered sub-unit skipped"),
            }
        }
        let id = plan.id.clone();
        let report = self.jobs[i].plan(units.iter().map(|(unit, _)| unit.clone()))?;

        let mut requested = HashSet::new();
        for (unit, work) in &units {
            let open = self.jobs[i].sub_unit_state(unit) == Some(SubUnitState::Requested);
            if open && requested.insert(unit.as_str()) {
                let key = CorrelationKey::sub_unit(id.as_str(), unit.as_str());
                request(&mut self.in_flight, bus, key, work);
            }
        }
        info!(job = %id, sub_units = units.len(), requested = requested.len(), "sub-units planned");
        self.job_done(report, bus)
    }

    fn on_work_failed(&mut self, event: &Event, bus: &Bus) -> anyhow::Result<()> {
        let Some((key, i)) = self.claim(event)? else {
            return Ok(());
        };
        let cause = event.str_field("cause").unwrap_or("unknown cause");
        self.fail(&key, i, cause, bus)
    }

    fn fail(&mut self, key: &CorrelationKey, i: usize, cause: &str, bus: &Bus) -> anyhow::Result<()> {
        let job = &mut self.jobs[i];
        let report = if key.is_plan() {
            Some(job.fail_plan(cause)?)
        } else {
            match key.unit() {
                None => job.fail_reference(cause)?,
                Some(unit) => job.fail_sub_unit(unit, cause)?,
            }
        };
        self.job_done(report, bus)
    }

    fn job_done(&mut self, report: Option<JobReport<Value>>, bus: &Bus) -> anyhow::Result<()> {
        let Some(report) = report else {
            return Ok(());
        };
        self.in_flight.retain(|key, _| key.job() != report.job);
        info!(
            job = %report.job,
            succeeded = report.succeeded,
            failed = report.failed,
            error = ?report.error,
            "job completed"
        );

        let mut event = Event::new(JOB_COMPLETED, SESSION)
            .with_field("job_id", json!(report.job))
            .with_field("results", serde_json::to_value(&report.results)?)
            .with_field("failures", serde_json::to_value(&report.failures)?);
        if let Some(error) = &report.error {
            event = event.with_field("error", json!(error));
        }
        bus.try_publish(event)?;
        Ok(())
    }

    fn on_job_completed(&mut self, event: &Event, bus: &Bus) -> anyhow::Result<()> {
        let job_id = event.str_field("job_id").unwrap_or_default();
        let Some(&i) = self.index.get(job_id) else {
            warn!(job = %job_id, producer = %event.producer(), "completion of unknown job ignored");
            return Ok(());
        };
        if !self.jobs[i].is_completed() || !self.counted.insert(job_id.to_string()) {
            warn!(job = %job_id, producer = %event.producer(), "unexpected job completion ignored");
            return Ok(());
        }

        self.remaining_jobs -= 1;
        debug!(job = %job_id, remaining = self.remaining_jobs, "job counted");
        if self.remaining_jobs == 0 {
            self.finalize(bus)?;
        }
        Ok(())
    }

    fn on_agent_degraded(&mut self, event: &Event, bus: &Bus) -> anyhow::Result<()> {
        let agent = event.str_field("agent").unwrap_or_default();
        let kinds: HashSet<&str> = event
            .field("kinds")
            .and_then(Value::as_array)
            .map(|kinds| kinds.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let cause = format!(
            "agent '{agent}' degraded: {}",
            event.str_field("cause").unwrap_or("unknown cause")
        );

        let mut keys: Vec<CorrelationKey> = self
            .in_flight
            .iter()
            .filter(|(_, kind)| kinds.contains(kind.as_str()))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        if !keys.is_empty() {
            warn!(agent = %agent, in_flight = keys.len(), "failing work served by degraded agent");
        }

        for key in keys {
            // Completing a job drops its other keys from the in-flight set.
            if self.in_flight.remove(&key).is_none() {
                continue;
            }
            if let Some(&i) = self.index.get(key.job()) {
                self.fail(&key, i, &cause, bus)?;
            }
        }
        Ok(())
    }

    fn finalize(&mut self, bus: &Bus) -> anyhow::Result<()> {
        if self.phase != Phase::Running {
            return Ok(());
        }
        self.phase = Phase::Finalized;

        let results = FinalResults {
            run_id: self.run_id.clone(),
            jobs: self.jobs.iter().map(Job::report).collect(),
        };
        info!(run = %self.run_id, results = results.result_count(), "final results ready");

        let event = Event::new(FINAL_RESULTS_READY, SESSION)
            .with_field("run_id", json!(self.run_id))
            .with_field("results", results.results_value())
            .with_field("failures", results.failures_value());
        self.final_results = Some(results);
        bus.try_publish(event)?;
        Ok(())
    }

    fn on_presentation_done(&mut self) -> anyhow::Result<()> {
        if self.phase != Phase::Finalized {
            warn!(run = %self.run_id, "presentation acknowledged before final results; ignored");
            return Ok(());
        }
        self.phase = Phase::Done;
        if let (Some(tx), Some(results)) = (self.done.take(), self.final_results.take()) {
            if tx.send(results).is_err() {
                debug!(run = %self.run_id, "orchestrator no longer waiting for results");
            }
        }
        Ok(())
    }
}

/// Publishes `work` for `key` and marks the key in flight.
fn request(
    in_flight: &mut HashMap<CorrelationKey, String>,
    bus: &Bus,
    key: CorrelationKey,
    work: &WorkItem,
) {
    in_flight.insert(key.clone(), work.kind.clone());
    bus.publish(contract::work_requested(SESSION, key, &work.kind, work.args.clone()));
}

fn discovered_unit(entry: &Value, unit_kind: &str) -> Option<(String, WorkItem)> {
    let (unit, args) = match entry {
        Value::String(unit) => (unit.clone(), None),
        Value::Object(fields) => (
            fields.get("unit")?.as_str()?.to_string(),
            fields.get("args").cloned(),
        ),
        _ => return None,
    };
    if unit.is_empty() {
        return None;
    }
    let args = args.unwrap_or_else(|| json!({ "unit": unit }));
    Some((unit, WorkItem::new(unit_kind, args)))
}

impl Handler for Session {
    fn name(&self) -> &str {
        "session"
    }

    fn handle(&mut self, event: &Event, bus: &Bus) -> anyhow::Result<()> {
        match event.name() {
            RUN_REQUESTED => self.on_run_requested(event, bus),
            WORK_COMPLETED => self.on_work_completed(event, bus),
            WORK_FAILED => self.on_work_failed(event, bus),
            JOB_COMPLETED => self.on_job_completed(event, bus),
            AGENT_DEGRADED => self.on_agent_degraded(event, bus),
            PRESENTATION_DONE => self.on_presentation_done(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Validator;
    use std::sync::{Arc, Mutex};

    fn keep_prerequisite(_unit: &str, _reference: &Value, prerequisite: &Value) -> Result<Option<Value>, String> {
        Ok(Some(prerequisite.clone()))
    }

    fn plan(id: &str, units: &[&str]) -> JobPlan {
        units.iter().fold(
            JobPlan::new(id, WorkItem::new("reference", json!({ "job": id }))),
            |plan, unit| plan.sub_unit(*unit, WorkItem::new("prices", json!({ "symbol": unit }))),
        )
    }

    type Trace = Arc<Mutex<Vec<String>>>;

    fn trace(bus: &Bus, events: &[&str]) -> Trace {
        let seen: Trace = Arc::default();
        let sink = Arc::clone(&seen);
        bus.subscribe_many(
            events,
            crate::handlers::FnHandler::new("trace", move |ev: &Event, _bus: &Bus| {
                let key = ev.correlation_key().map(ToString::to_string);
                sink.lock().unwrap().push(match key {
                    Some(key) => format!("{}:{key}", ev.name()),
                    None => ev.name().to_string(),
                });
                Ok(())
            }),
        )
        .unwrap();
        seen
    }

    #[tokio::test]
    async fn run_request_seeds_work_in_plan_order() {
        let (bus, dispatcher) = Bus::new(Validator::with_contracts());
        let (session, _done) = Session::new("r1", vec![plan("1h", &["eth", "sol"])], keep_prerequisite);
        session.subscribe(&bus).unwrap();
        let seen = trace(&bus, &[contract::WORK_REQUESTED]);
        let join = dispatcher.spawn();

        bus.publish(contract::run_requested("test", "other-run"));
        bus.publish(contract::run_requested("test", "r1"));
        bus.publish(contract::run_requested("test", "r1"));
        bus.shutdown();
        join.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "WorkRequested:1h/@reference",
                "WorkRequested:1h/eth",
                "WorkRequested:1h/sol",
            ]
        );
    }

    #[tokio::test]
    async fn stale_and_degraded_results_are_handled() {
        let (bus, dispatcher) = Bus::new(Validator::with_contracts());
        let (session, done) = Session::new("r1", vec![plan("1h", &["eth", "sol"])], keep_prerequisite);
        session.subscribe(&bus).unwrap();
        let seen = trace(&bus, &[contract::JOB_COMPLETED, contract::FINAL_RESULTS_READY]);
        bus.subscribe_fn(FINAL_RESULTS_READY, "presenter", |_ev, bus| {
            bus.publish(contract::presentation_done("display"));
            Ok(())
        })
        .unwrap();
        let join = dispatcher.spawn();

        let reference = CorrelationKey::reference("1h");
        let eth = CorrelationKey::sub_unit("1h", "eth");
        let sol = CorrelationKey::sub_unit("1h", "sol");

        bus.publish(contract::run_requested("test", "r1"));
        bus.publish(contract::work_completed("fetch", eth.clone(), "prices", json!([1, 2])));
        // Duplicate delivery for a key already resolved is stale, not an error.
        bus.publish(contract::work_completed("fetch", eth, "prices", json!([9])));
        bus.publish(contract::agent_degraded("fetch", &["prices"], "api key revoked"));
        bus.publish(contract::work_failed("fetch", sol, "prices", "late failure"));
        bus.publish(contract::work_completed("ref", reference, "reference", json!([0])));

        let results = done.await.unwrap();
        bus.shutdown();
        join.await.unwrap();

        let job = &results.jobs[0];
        assert_eq!(job.results.len(), 1);
        assert_eq!(job.results[0].unit, "eth");
        assert_eq!(job.failures.len(), 1);
        assert_eq!(job.failures[0].unit, "sol");
        assert!(job.failures[0].cause.contains("api key revoked"));
        assert_eq!(*seen.lock().unwrap(), vec!["JobCompleted", "FinalResultsReady"]);
        assert_eq!(bus.diagnostics().count("handler_failed"), 0);
    }

    #[tokio::test]
    async fn empty_plan_finalizes_immediately() {
        let (bus, dispatcher) = Bus::new(Validator::with_contracts());
        let (session, _done) = Session::new("r1", Vec::new(), keep_prerequisite);
        session.subscribe(&bus).unwrap();
        let seen = trace(&bus, &[contract::FINAL_RESULTS_READY]);
        let join = dispatcher.spawn();

        bus.publish(contract::run_requested("test", "r1"));
        bus.shutdown();
        join.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["FinalResultsReady"]);
    }

    #[tokio::test]
    async fn forged_job_completion_is_not_counted() {
        let (bus, dispatcher) = Bus::new(Validator::with_contracts());
        let (session, _done) = Session::new("r1", vec![plan("1h", &["eth"])], keep_prerequisite);
        session.subscribe(&bus).unwrap();
        let seen = trace(&bus, &[contract::FINAL_RESULTS_READY]);
        let join = dispatcher.spawn();

        bus.publish(contract::run_requested("test", "r1"));
        bus.publish(
            Event::new(JOB_COMPLETED, "intruder")
                .with_field("job_id", json!("1h"))
                .with_field("results", json!([]))
                .with_field("failures", json!([])),
        );
        bus.shutdown();
        join.await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    fn presenter(bus: &Bus) {
        bus.subscribe_fn(FINAL_RESULTS_READY, "presenter", |_ev, bus| {
            bus.publish(contract::presentation_done("display"));
            Ok(())
        })
        .unwrap();
    }

    #[tokio::test]
    async fn result_of_another_kind_does_not_claim_the_key() {
        let (bus, dispatcher) = Bus::new(Validator::with_contracts());
        let (session, done) = Session::new("r1", vec![plan("1h", &["eth"])], keep_prerequisite);
        session.subscribe(&bus).unwrap();
        presenter(&bus);
        let join = dispatcher.spawn();

        let eth = CorrelationKey::sub_unit("1h", "eth");
        bus.publish(contract::run_requested("test", "r1"));
        bus.publish(contract::work_completed("store", eth.clone(), "persist", json!("WRONG")));
        bus.publish(contract::work_failed("store", eth.clone(), "persist", "not mine"));
        bus.publish(contract::work_completed("fetch", eth, "prices", json!("RIGHT")));
        bus.publish(contract::work_completed("ref", CorrelationKey::reference("1h"), "reference", json!(0)));

        let results = done.await.unwrap();
        bus.shutdown();
        join.await.unwrap();

        let job = &results.jobs[0];
        assert_eq!(job.results.len(), 1);
        assert_eq!(job.results[0].output, json!("RIGHT"));
        assert!(job.failures.is_empty());
    }

    #[tokio::test]
    async fn discovery_seeds_sub_units_at_run_time() {
        let (bus, dispatcher) = Bus::new(Validator::with_contracts());
        let plan = JobPlan::new("1d", WorkItem::new("reference", json!({})))
            .sub_unit("eth", WorkItem::new("prices", json!({ "symbol": "eth" })))
            .discover(WorkItem::new("listing", json!({ "below": 25 })), "prices");
        let (session, done) = Session::new("r1", vec![plan], keep_prerequisite);
        session.subscribe(&bus).unwrap();
        presenter(&bus);
        let seen = trace(&bus, &[contract::WORK_REQUESTED, contract::JOB_COMPLETED]);
        let requests: Arc<Mutex<Vec<Value>>> = Arc::default();
        let sink = Arc::clone(&requests);
        bus.subscribe_fn(contract::WORK_REQUESTED, "args", move |ev, _bus| {
            sink.lock().unwrap().push(ev.field("args").cloned().unwrap_or_default());
            Ok(())
        })
        .unwrap();
        let join = dispatcher.spawn();

        bus.publish(contract::run_requested("test", "r1"));
        // The reference alone must not complete a job still waiting on discovery.
        bus.publish(contract::work_completed("ref", CorrelationKey::reference("1d"), "reference", json!(0)));
        bus.publish(contract::work_completed(
            "listing",
            CorrelationKey::plan("1d"),
            "listing",
            json!(["zil", { "unit": "one", "args": { "symbol": "one" } }, 7, "eth"]),
        ));
        for unit in ["eth", "zil", "one"] {
            bus.publish(contract::work_completed(
                "fetch",
                CorrelationKey::sub_unit("1d", unit),
                "prices",
                json!(unit),
            ));
        }

        let results = done.await.unwrap();
        bus.shutdown();
        join.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "WorkRequested:1d/@reference",
                "WorkRequested:1d/@plan",
                "WorkRequested:1d/eth",
                "WorkRequested:1d/zil",
                "WorkRequested:1d/one",
                "JobCompleted",
            ]
        );
        assert_eq!(requests.lock().unwrap()[3], json!({ "unit": "zil" }));
        assert_eq!(requests.lock().unwrap()[4], json!({ "symbol": "one" }));
        let units: Vec<_> = results.jobs[0].results.iter().map(|r| r.unit.as_str()).collect();
        assert_eq!(units, vec!["eth", "zil", "one"]);
    }

    #[tokio::test]
    async fn failed_discovery_completes_the_job_with_an_error() {
        let (bus, dispatcher) = Bus::new(Validator::with_contracts());
        let plan = JobPlan::new("1d", WorkItem::new("reference", json!({})))
            .discover(WorkItem::new("listing", json!({})), "prices");
        let (session, done) = Session::new("r1", vec![plan], keep_prerequisite);
        session.subscribe(&bus).unwrap();
        presenter(&bus);
        let join = dispatcher.spawn();

        bus.publish(contract::run_requested("test", "r1"));
        let discovery = CorrelationKey::plan("1d");
        bus.publish(contract::work_failed("listing", discovery, "listing", "exchange offline"));
        // Stale once the job completed.
        bus.publish(contract::work_completed("ref", CorrelationKey::reference("1d"), "reference", json!(0)));

        let results = done.await.unwrap();
        bus.shutdown();
        join.await.unwrap();

        assert_eq!(
            results.jobs[0].error.as_deref(),
            Some("sub-units unavailable: exchange offline")
        );
        assert_eq!(
            results.failures_value(),
            json!([{ "job": "1d", "unit": null, "cause": "sub-units unavailable: exchange offline" }])
        );
        assert_eq!(bus.diagnostics().count("handler_failed"), 0);
    }
}
