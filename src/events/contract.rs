//! # Pipeline event contracts.
//!
//! Names, schemas and constructors of the events exchanged between the
//! orchestrator and the agents. [`Validator::with_contracts`] registers them
//! all at once.
//!
//! | Event               | Required fields                        | Correlated |
//! |---------------------|----------------------------------------|------------|
//! | `ConfigBroadcast`   | run_id, parameters                     | no         |
//! | `RunRequested`      | run_id                                 | no         |
//! | `WorkRequested`     | kind, args                             | yes        |
//! | `WorkCompleted`     | kind, result                           | yes        |
//! | `WorkFailed`        | kind, cause                            | yes        |
//! | `JobCompleted`      | job_id, results, failures              | no         |
//! | `FinalResultsReady` | run_id, results, failures              | no         |
//! | `PresentationDone`  | -                                      | no         |
//! | `AgentDegraded`     | agent, kinds, cause                    | no         |

use serde_json::{Value, json};

use super::event::{CorrelationKey, Event};
use super::schema::{FieldShape, Schema, Validator};
use crate::error::ValidationError;

pub const CONFIG_BROADCAST: &str = "ConfigBroadcast";
pub const RUN_REQUESTED: &str = "RunRequested";
pub const WORK_REQUESTED: &str = "WorkRequested";
pub const WORK_COMPLETED: &str = "WorkCompleted";
pub const WORK_FAILED: &str = "WorkFailed";
pub const JOB_COMPLETED: &str = "JobCompleted";
pub const FINAL_RESULTS_READY: &str = "FinalResultsReady";
pub const PRESENTATION_DONE: &str = "PresentationDone";
pub const AGENT_DEGRADED: &str = "AgentDegraded";

impl Validator {
    /// Validator with every pipeline contract registered.
    pub fn with_contracts() -> Self {
        contracts().into_iter().collect()
    }
}

/// Registers every pipeline contract on `validator`.
///
/// Fails with [`ValidationError::DuplicateSchema`] if one of the names is taken.
pub fn register_contracts(validator: &mut Validator) -> Result<(), ValidationError> {
    for (name, schema) in contracts() {
        validator.register(name, schema)?;
    }
    Ok(())
}

fn contracts() -> [(&'static str, Schema); 9] {
    use FieldShape::{Any, Array, Object, String as Str};

    [
        (
            CONFIG_BROADCAST,
            Schema::new().field("run_id", Str).field("parameters", Object),
        ),
        (RUN_REQUESTED, Schema::new().field("run_id", Str)),
        (
            WORK_REQUESTED,
            Schema::new().field("kind", Str).field("args", Any).correlated(),
        ),
        (
            WORK_COMPLETED,
            Schema::new().field("kind", Str).field("result", Any).correlated(),
        ),
        (
            WORK_FAILED,
            Schema::new().field("kind", Str).field("cause", Str).correlated(),
        ),
        (
            JOB_COMPLETED,
            Schema::new()
                .field("job_id", Str)
                .field("results", Array)
                .field("failures", Array),
        ),
        (
            FINAL_RESULTS_READY,
            Schema::new()
                .field("run_id", Str)
                .field("results", Array)
                .field("failures", Array),
        ),
        (PRESENTATION_DONE, Schema::new()),
        (
            AGENT_DEGRADED,
            Schema::new()
                .field("agent", Str)
                .field("kinds", Array)
                .field("cause", Str),
        ),
    ]
}

/// `ConfigBroadcast { run_id, parameters }`.
pub fn config_broadcast(producer: &str, run_id: &str, parameters: Value) -> Event {
    Event::new(CONFIG_BROADCAST, producer)
        .with_field("run_id", json!(run_id))
        .with_field("parameters", parameters)
}

/// `RunRequested { run_id }`.
pub fn run_requested(producer: &str, run_id: &str) -> Event {
    Event::new(RUN_REQUESTED, producer).with_field("run_id", json!(run_id))
}

/// `WorkRequested { kind, args }` for `key`.
pub fn work_requested(producer: &str, key: CorrelationKey, kind: &str, args: Value) -> Event {
    Event::new(WORK_REQUESTED, producer)
        .with_field("kind", json!(kind))
        .with_field("args", args)
        .with_correlation(key)
}

/// `WorkCompleted { kind, result }` for `key`.
pub fn work_completed(producer: &str, key: CorrelationKey, kind: &str, result: Value) -> Event {
    Event::new(WORK_COMPLETED, producer)
        .with_field("kind", json!(kind))
        .with_field("result", result)
        .with_correlation(key)
}

/// `WorkFailed { kind, cause }` for `key`.
pub fn work_failed(producer: &str, key: CorrelationKey, kind: &str, cause: &str) -> Event {
    Event::new(WORK_FAILED, producer)
        .with_field("kind", json!(kind))
        .with_field("cause", json!(cause))
        .with_correlation(key)
}

/// `PresentationDone`.
pub fn presentation_done(producer: &str) -> Event {
    Event::new(PRESENTATION_DONE, producer)
}

/// `AgentDegraded { agent, kinds, cause }`.
pub fn agent_degraded(agent: &str, kinds: &[&str], cause: &str) -> Event {
    Event::new(AGENT_DEGRADED, agent)
        .with_field("agent", json!(agent))
        .with_field("kinds", json!(kinds))
        .with_field("cause", json!(cause))
}
