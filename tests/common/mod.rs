#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use pipevisor::{
    Agent, Bus, Config, CorrelationKey, Event, FnHandler, HandlerId, JobPlan, WorkContext,
    WorkError, WorkItem, Worker, contract,
};
use serde_json::{Value, json};

pub type Trace = Arc<Mutex<Vec<String>>>;

/// Records `name:key` (or `name`) for every event in `events`.
pub fn trace(bus: &Bus, events: &[&str]) -> Trace {
    let seen: Trace = Arc::default();
    let sink = Arc::clone(&seen);
    bus.subscribe_many(
        events,
        FnHandler::new("trace", move |ev: &Event, _bus: &Bus| {
            let line = match ev.correlation_key() {
                Some(key) => format!("{}:{key}", ev.name()),
                None => ev.name().to_string(),
            };
            sink.lock().unwrap().push(line);
            Ok(())
        }),
    )
    .unwrap();
    seen
}

/// Acknowledges every `FinalResultsReady` with `PresentationDone`.
pub fn presenter(bus: &Bus) -> HandlerId {
    bus.subscribe_fn(contract::FINAL_RESULTS_READY, "presenter", |_ev, bus| {
        bus.publish(contract::presentation_done("presenter"));
        Ok(())
    })
    .unwrap()
}

pub fn count(trace: &Trace, prefix: &str) -> usize {
    trace.lock().unwrap().iter().filter(|l| l.starts_with(prefix)).count()
}

/// Job with a `reference` work item and one `prices` sub-unit per symbol.
pub fn plan(id: &str, symbols: &[&str]) -> JobPlan {
    symbols.iter().fold(
        JobPlan::new(id, WorkItem::new("reference", json!({ "timeframe": id }))),
        |plan, symbol| {
            plan.sub_unit(
                *symbol,
                WorkItem::new("prices", json!({ "timeframe": id, "symbol": symbol })),
            )
        },
    )
}

/// Keeps the prerequisite as the join output.
pub fn keep(_unit: &str, _reference: &Value, prerequisite: &Value) -> Result<Option<Value>, String> {
    Ok(Some(prerequisite.clone()))
}

pub type Op = (CorrelationKey, String, Value);

/// Turns `WorkRequested` of `kind` into agent operations.
pub fn listen_for<W: Worker<Op = Op>>(agent: &Agent<W>, kind: impl Into<String>) {
    let kind = kind.into();
    agent
        .listen(contract::WORK_REQUESTED, move |ev| {
            if ev.str_field("kind")? != kind {
                return None;
            }
            Some((
                ev.correlation_key()?.clone(),
                kind.clone(),
                ev.field("args")?.clone(),
            ))
        })
        .unwrap();
}

/// Scripted worker: answers from `script` (by sub-unit, `@reference` or `@plan`),
/// echoing the args when no entry exists. Failures publish `WorkFailed`.
pub struct Scripted {
    pub name: &'static str,
    pub kinds: Vec<String>,
    pub script: HashMap<String, Script>,
    pub attempts: Arc<AtomicU32>,
}

#[derive(Clone, Debug)]
pub enum Script {
    Transient,
    Permanent,
    Fatal,
    Sleep(std::time::Duration),
}

impl Scripted {
    pub fn new(name: &'static str, kind: &str) -> Self {
        Self {
            name,
            kinds: vec![kind.to_string()],
            script: HashMap::new(),
            attempts: Arc::default(),
        }
    }

    pub fn with(mut self, unit: &str, script: Script) -> Self {
        self.script.insert(unit.to_string(), script);
        self
    }

    pub fn into_agent(self, bus: &Bus, cfg: Config) -> Agent<Self> {
        let kind = self.kinds[0].clone();
        let agent = Agent::new(self, bus.clone(), cfg);
        listen_for(&agent, kind);
        agent
    }
}

#[async_trait]
impl Worker for Scripted {
    type Op = Op;

    fn name(&self) -> &str {
        self.name
    }

    fn kinds(&self) -> Vec<String> {
        self.kinds.clone()
    }

    async fn execute(&mut self, (key, kind, args): Op, ctx: &WorkContext) -> Result<(), WorkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let unit = match key.unit() {
            Some(unit) => unit.to_string(),
            None if key.is_plan() => "@plan".to_string(),
            None => "@reference".to_string(),
        };
        match self.script.get(&unit).cloned() {
            Some(Script::Transient) => return Err(WorkError::transient("rate limited")),
            Some(Script::Permanent) => return Err(WorkError::permanent("symbol not listed")),
            Some(Script::Fatal) => return Err(WorkError::fatal("api key revoked")),
            Some(Script::Sleep(d)) => tokio::time::sleep(d).await,
            None => {}
        }
        ctx.bus.publish(contract::work_completed(self.name, key, &kind, args));
        Ok(())
    }

    fn on_failed(&mut self, (key, kind, _): &Op, err: &WorkError, bus: &Bus) {
        bus.publish(contract::work_failed(self.name, key.clone(), kind, &err.to_string()));
    }
}
