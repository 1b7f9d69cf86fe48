//! Pipeline layer: jobs, the run session and analysis parameters.
//!
//! - [`job`]: fan-in state machine joining N sub-unit results with one reference;
//! - [`session`]: bus handler owning the jobs of one run;
//! - [`params`]: parameters broadcast in `ConfigBroadcast`.

pub mod job;
mod params;
mod session;

pub use job::{Job, JobReport, JobState, JoinedResult, Joiner, Resolution, SubUnitState, UnitFailure};
pub use params::AnalysisParams;
pub use session::{Discovery, FinalResults, JobPlan, SESSION, SESSION_EVENTS, Session, WorkItem};
