//! # Job: fan-in of one reference result and N sub-unit results.
//!
//! A [`Job`] gates a join step: sub-unit `u` is joined only once **both** the
//! job's reference result and `u`'s own prerequisite are available. Arrival
//! order of the two is irrelevant.
//!
//! ```text
//!                 resolve_reference          pending empty
//! AwaitingReference ─────────────► Processing ─────────────► Completed
//!        │                                                      ▲
//!        └──────────── fail_reference (fails all pending) ──────┘
//!
//! unplanned ──plan(sub-units)──► planned     (fail_plan completes at once)
//!
//! sub-unit:  Requested ──prerequisite──► Ready ──join──► Resolved(Succeeded | Failed)
//!                 └──────────── fail_sub_unit ─────────► Resolved(Failed)
//! ```
//!
//! ## Rules
//! - `pending` only shrinks; each sub-unit resolves exactly once.
//! - The transition to `Completed` returns a [`JobReport`] exactly once.
//! - `Completed` is absorbing: any later mutation is [`JobError::Completed`].
//! - A job built with [`Job::unplanned`] never completes before [`Job::plan`]
//!   or [`Job::fail_plan`]. Units planned after a reference failure fail at once.
//!
//! All mutation happens inside bus handlers, so a `Job` is never shared.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::JobError;

/// Job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for the reference result.
    AwaitingReference,
    /// Reference known; joining sub-units as their prerequisites arrive.
    Processing,
    /// Every sub-unit resolved.
    Completed,
}

/// Terminal outcome of a sub-unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Joined (with or without a result).
    Succeeded,
    /// Failed upstream or in the join.
    Failed,
}

/// Sub-unit lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubUnitState {
    /// Work requested, prerequisite not yet delivered.
    Requested,
    /// Prerequisite delivered, waiting for the reference.
    Ready,
    /// Removed from `pending`.
    Resolved(Resolution),
}

/// The join step of a job.
///
/// Returns `Ok(Some(output))` to accept a result, `Ok(None)` to filter the
/// sub-unit out (it still counts as succeeded) and `Err(cause)` to fail it.
pub trait Joiner<T, O> {
    /// Joins the prerequisite of sub-unit `unit` with the job's reference.
    fn join(&mut self, unit: &str, reference: &T, prerequisite: &T) -> Result<Option<O>, String>;
}

impl<T, O, F> Joiner<T, O> for F
where
    F: FnMut(&str, &T, &T) -> Result<Option<O>, String>,
{
    fn join(&mut self, unit: &str, reference: &T, prerequisite: &T) -> Result<Option<O>, String> {
        self(unit, reference, prerequisite)
    }
}

/// An accepted join output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinedResult<O> {
    /// Sub-unit id.
    pub unit: String,
    /// Join output.
    pub output: O,
}

/// A failed sub-unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    /// Sub-unit id.
    pub unit: String,
    /// Human-readable cause.
    pub cause: String,
}

/// Snapshot of a job at completion.
///
/// Results and failures are listed in plan order of their sub-units, so two
/// runs differing only in arrival order produce equal reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport<O> {
    /// Job id.
    pub job: String,
    /// Sub-units joined successfully (including filtered ones).
    pub succeeded: usize,
    /// Sub-units that failed.
    pub failed: usize,
    /// Accepted outputs.
    pub results: Vec<JoinedResult<O>>,
    /// Failed sub-units.
    pub failures: Vec<UnitFailure>,
    /// Job-level failure, set when the sub-units could not be planned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

enum Slot<T> {
    Requested,
    Ready(T),
    Resolved(Resolution),
}

impl<T> Slot<T> {
    fn state(&self) -> SubUnitState {
        match self {
            Slot::Requested => SubUnitState::Requested,
            Slot::Ready(_) => SubUnitState::Ready,
            Slot::Resolved(r) => SubUnitState::Resolved(*r),
        }
    }
}

/// Fan-in state machine for one job.
pub struct Job<T, O> {
    id: String,
    state: JobState,
    planned: bool,
    reference: Option<T>,
    reference_failure: Option<String>,
    error: Option<String>,
    units: Vec<(String, Slot<T>)>,
    index: HashMap<String, usize>,
    pending: usize,
    succeeded: usize,
    failed: usize,
    results: Vec<JoinedResult<O>>,
    failures: Vec<UnitFailure>,
}

impl<T, O: Clone> Job<T, O> {
    /// Creates a job awaiting its reference, with every sub-unit pending.
    ///
    /// Repeated sub-unit ids are kept once.
    pub fn new<I, S>(id: impl Into<String>, sub_units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut job = Self::unplanned(id);
        job.planned = true;
        for unit in sub_units {
            job.insert(unit.into());
        }
        job.pending = job.units.len();
        job
    }

    /// Creates a job whose sub-units are not known yet.
    ///
    /// It stays open until [`Job::plan`] or [`Job::fail_plan`] is called.
    pub fn unplanned(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: JobState::AwaitingReference,
            planned: false,
            reference: None,
            reference_failure: None,
            error: None,
            units: Vec::new(),
            index: HashMap::new(),
            pending: 0,
            succeeded: 0,
            failed: 0,
            results: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Job id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// True once the job has reported completion.
    pub fn is_completed(&self) -> bool {
        self.state == JobState::Completed
    }

    /// True once the sub-units are known.
    pub fn is_planned(&self) -> bool {
        self.planned
    }

    /// True once the reference result was delivered.
    pub fn is_reference_ready(&self) -> bool {
        self.reference.is_some()
    }

    /// Sub-units not yet resolved, in plan order.
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.units
            .iter()
            .filter(|(_, slot)| !matches!(slot, Slot::Resolved(_)))
            .map(|(unit, _)| unit.as_str())
    }

    /// Number of sub-units not yet resolved.
    pub fn pending_len(&self) -> usize {
        self.pending
    }

    /// Sub-units resolved as succeeded, filtered joins included.
    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    /// Sub-units resolved as failed.
    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Accepted outputs, in join order.
    pub fn results(&self) -> &[JoinedResult<O>] {
        &self.results
    }

    /// Failed sub-units, in resolution order.
    pub fn failures(&self) -> &[UnitFailure] {
        &self.failures
    }

    /// All sub-unit ids, in plan order.
    pub fn sub_units(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(|(unit, _)| unit.as_str())
    }

    /// State of sub-unit `unit`, `None` if unknown.
    pub fn sub_unit_state(&self, unit: &str) -> Option<SubUnitState> {
        self.index.get(unit).map(|&i| self.units[i].1.state())
    }

    /// Sets the sub-units of an unplanned job.
    ///
    /// Repeated ids are kept once. If the reference already failed, the new
    /// sub-units fail with the same cause, which may complete the job.
    pub fn plan<I, S>(&mut self, sub_units: I) -> Result<Option<JobReport<O>>, JobError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_open()?;
        self.ensure_unplanned()?;
        self.planned = true;
        for unit in sub_units {
            let unit = unit.into();
            if !self.insert(unit.clone()) {
                continue;
            }
            match &self.reference_failure {
                Some(cause) => {
                    let last = self.units.len() - 1;
                    self.units[last].1 = Slot::Resolved(Resolution::Failed);
                    self.failures.push(UnitFailure {
                        unit,
                        cause: cause.clone(),
                    });
                }
                None => self.pending += 1,
            }
        }
        self.recount();
        Ok(self.complete_if_done())
    }

    /// Marks the sub-units as unavailable; the job completes with `error` set.
    pub fn fail_plan(&mut self, cause: &str) -> Result<JobReport<O>, JobError> {
        self.ensure_open()?;
        self.ensure_unplanned()?;
        self.planned = true;
        self.error = Some(format!("sub-units unavailable: {cause}"));
        self.state = JobState::Completed;
        Ok(self.report())
    }

    /// Delivers the reference result and joins every `Ready` sub-unit.
    ///
    /// A job without sub-units completes here.
    pub fn resolve_reference(
        &mut self,
        reference: T,
        joiner: &mut (impl Joiner<T, O> + ?Sized),
    ) -> Result<Option<JobReport<O>>, JobError> {
        self.ensure_open()?;
        self.ensure_no_reference()?;
        self.state = JobState::Processing;
        let reference = self.reference.insert(reference);

        for i in 0..self.units.len() {
            if !matches!(self.units[i].1, Slot::Ready(_)) {
                continue;
            }
            let slot = std::mem::replace(&mut self.units[i].1, Slot::Requested);
            if let Slot::Ready(prerequisite) = slot {
                let unit = self.units[i].0.clone();
                let outcome = joiner.join(&unit, reference, &prerequisite);
                Self::record(
                    &mut self.units[i].1,
                    &mut self.results,
                    &mut self.failures,
                    unit,
                    outcome,
                );
            }
        }
        self.recount();
        Ok(self.complete_if_done())
    }

    /// Marks the reference as unavailable; every pending sub-unit fails with `cause`.
    pub fn fail_reference(&mut self, cause: &str) -> Result<Option<JobReport<O>>, JobError> {
        self.ensure_open()?;
        self.ensure_no_reference()?;
        let cause = format!("reference unavailable: {cause}");
        for (unit, slot) in &mut self.units {
            if !matches!(slot, Slot::Resolved(_)) {
                *slot = Slot::Resolved(Resolution::Failed);
                self.failures.push(UnitFailure {
                    unit: unit.clone(),
                    cause: cause.clone(),
                });
            }
        }
        self.reference_failure = Some(cause);
        self.recount();
        self.state = JobState::Processing;
        Ok(self.complete_if_done())
    }

    /// Delivers the prerequisite of `unit`; joins immediately if the reference is known.
    pub fn resolve_prerequisite(
        &mut self,
        unit: &str,
        prerequisite: T,
        joiner: &mut (impl Joiner<T, O> + ?Sized),
    ) -> Result<Option<JobReport<O>>, JobError> {
        self.ensure_open()?;
        let i = self.slot_index(unit)?;
        match self.units[i].1 {
            Slot::Requested => {}
            Slot::Ready(_) => {
                return Err(JobError::DuplicatePrerequisite {
                    job: self.id.clone(),
                    unit: unit.to_string(),
                });
            }
            Slot::Resolved(_) => return Err(self.already_resolved(unit)),
        }

        match &self.reference {
            None => {
                self.units[i].1 = Slot::Ready(prerequisite);
                Ok(None)
            }
            Some(reference) => {
                let outcome = joiner.join(unit, reference, &prerequisite);
                Self::record(
                    &mut self.units[i].1,
                    &mut self.results,
                    &mut self.failures,
                    unit.to_string(),
                    outcome,
                );
                self.recount();
                Ok(self.complete_if_done())
            }
        }
    }

    /// Fails `unit` with `cause`, whether or not its prerequisite arrived.
    pub fn fail_sub_unit(&mut self, unit: &str, cause: &str) -> Result<Option<JobReport<O>>, JobError> {
        self.ensure_open()?;
        let i = self.slot_index(unit)?;
        if matches!(self.units[i].1, Slot::Resolved(_)) {
            return Err(self.already_resolved(unit));
        }
        self.units[i].1 = Slot::Resolved(Resolution::Failed);
        self.failures.push(UnitFailure {
            unit: unit.to_string(),
            cause: cause.to_string(),
        });
        self.recount();
        Ok(self.complete_if_done())
    }

    fn record(
        slot: &mut Slot<T>,
        results: &mut Vec<JoinedResult<O>>,
        failures: &mut Vec<UnitFailure>,
        unit: String,
        outcome: Result<Option<O>, String>,
    ) {
        match outcome {
            Ok(Some(output)) => {
                *slot = Slot::Resolved(Resolution::Succeeded);
                results.push(JoinedResult { unit, output });
            }
            Ok(None) => *slot = Slot::Resolved(Resolution::Succeeded),
            Err(cause) => {
                *slot = Slot::Resolved(Resolution::Failed);
                failures.push(UnitFailure { unit, cause });
            }
        }
    }

    fn recount(&mut self) {
        let (mut pending, mut succeeded, mut failed) = (0, 0, 0);
        for (_, slot) in &self.units {
            match slot {
                Slot::Resolved(Resolution::Succeeded) => succeeded += 1,
                Slot::Resolved(Resolution::Failed) => failed += 1,
                _ => pending += 1,
            }
        }
        debug_assert!(pending <= self.pending, "pending grew");
        self.pending = pending;
        self.succeeded = succeeded;
        self.failed = failed;
    }

    fn complete_if_done(&mut self) -> Option<JobReport<O>> {
        let reference_settled = self.reference.is_some() || self.reference_failure.is_some();
        if !self.planned || self.pending > 0 || !reference_settled {
            return None;
        }
        self.state = JobState::Completed;
        Some(self.report())
    }

    /// Report with results and failures in plan order.
    pub fn report(&self) -> JobReport<O> {
        let position = |unit: &str| self.index.get(unit).copied().unwrap_or(usize::MAX);
        let mut results = self.results.clone();
        results.sort_by_key(|r| position(&r.unit));
        let mut failures = self.failures.clone();
        failures.sort_by_key(|f| position(&f.unit));

        JobReport {
            job: self.id.clone(),
            succeeded: self.succeeded,
            failed: self.failed,
            results,
            failures,
            error: self.error.clone(),
        }
    }

    /// Adds `unit` as `Requested`; false if it is already known.
    fn insert(&mut self, unit: String) -> bool {
        if self.index.contains_key(&unit) {
            return false;
        }
        self.index.insert(unit.clone(), self.units.len());
        self.units.push((unit, Slot::Requested));
        true
    }

    fn ensure_open(&self) -> Result<(), JobError> {
        if self.is_completed() {
            return Err(JobError::Completed { job: self.id.clone() });
        }
        Ok(())
    }

    fn ensure_unplanned(&self) -> Result<(), JobError> {
        if self.planned {
            return Err(JobError::AlreadyPlanned { job: self.id.clone() });
        }
        Ok(())
    }

    fn ensure_no_reference(&self) -> Result<(), JobError> {
        if self.reference.is_some() || self.reference_failure.is_some() {
            return Err(JobError::DuplicateReference { job: self.id.clone() });
        }
        Ok(())
    }

    fn slot_index(&self, unit: &str) -> Result<usize, JobError> {
        self.index.get(unit).copied().ok_or_else(|| JobError::UnknownSubUnit {
            job: self.id.clone(),
            unit: unit.to_string(),
        })
    }

    fn already_resolved(&self, unit: &str) -> JobError {
        JobError::AlreadyResolved {
            job: self.id.clone(),
            unit: unit.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Multiplies reference and prerequisite; filters zero, fails negatives.
    fn product(_unit: &str, reference: &i64, prerequisite: &i64) -> Result<Option<i64>, String> {
        match reference * prerequisite {
            0 => Ok(None),
            p if p < 0 => Err(format!("negative product {p}")),
            p => Ok(Some(p)),
        }
    }

    fn job() -> Job<i64, i64> {
        Job::new("1h", ["eth", "sol", "ada"])
    }

    #[test]
    fn prerequisite_before_reference_is_deferred() {
        let mut job = job();
        let mut join = product;

        assert_eq!(job.resolve_prerequisite("eth", 3, &mut join).unwrap(), None);
        assert_eq!(job.sub_unit_state("eth"), Some(SubUnitState::Ready));
        assert!(job.results().is_empty());

        assert_eq!(job.resolve_reference(2, &mut join).unwrap(), None);
        assert_eq!(job.state(), JobState::Processing);
        assert_eq!(job.results(), &[JoinedResult { unit: "eth".into(), output: 6 }]);
        assert_eq!(job.pending().collect::<Vec<_>>(), vec!["sol", "ada"]);
    }

    #[test]
    fn join_order_does_not_change_the_outcome() {
        let mut join = product;

        let mut early = job();
        early.resolve_prerequisite("ada", 5, &mut join).unwrap();
        early.resolve_prerequisite("eth", 3, &mut join).unwrap();
        early.resolve_reference(2, &mut join).unwrap();
        let a = early.resolve_prerequisite("sol", -1, &mut join).unwrap().unwrap();

        let mut late = job();
        late.resolve_reference(2, &mut join).unwrap();
        late.resolve_prerequisite("sol", -1, &mut join).unwrap();
        late.resolve_prerequisite("eth", 3, &mut join).unwrap();
        let b = late.resolve_prerequisite("ada", 5, &mut join).unwrap().unwrap();

        assert_eq!(a, b);
        assert_eq!(a.succeeded, 2);
        assert_eq!(a.failed, 1);
        assert_eq!(
            a.results,
            vec![
                JoinedResult { unit: "eth".into(), output: 6 },
                JoinedResult { unit: "ada".into(), output: 10 },
            ]
        );
    }

    #[test]
    fn completion_is_reported_once() {
        let mut job = job();
        let mut join = product;
        job.resolve_reference(1, &mut join).unwrap();
        job.resolve_prerequisite("eth", 1, &mut join).unwrap();
        job.fail_sub_unit("sol", "symbol not listed").unwrap();
        let report = job.resolve_prerequisite("ada", 0, &mut join).unwrap();

        let report = report.expect("job completes on its last sub-unit");
        assert_eq!((report.succeeded, report.failed), (2, 1));
        assert_eq!(report.results.len(), 1, "filtered join adds no result");
        assert!(job.is_completed());

        assert_eq!(
            job.fail_sub_unit("eth", "late"),
            Err(JobError::Completed { job: "1h".into() })
        );
        assert!(matches!(
            job.resolve_reference(1, &mut join),
            Err(JobError::Completed { .. })
        ));
    }

    #[test]
    fn invalid_transitions_are_errors() {
        let mut job = job();
        let mut join = product;

        assert!(matches!(
            job.resolve_prerequisite("doge", 1, &mut join),
            Err(JobError::UnknownSubUnit { .. })
        ));

        job.resolve_prerequisite("eth", 1, &mut join).unwrap();
        assert!(matches!(
            job.resolve_prerequisite("eth", 1, &mut join),
            Err(JobError::DuplicatePrerequisite { .. })
        ));

        job.resolve_reference(1, &mut join).unwrap();
        assert!(matches!(
            job.resolve_reference(1, &mut join),
            Err(JobError::DuplicateReference { .. })
        ));
        assert!(matches!(
            job.fail_reference("late"),
            Err(JobError::DuplicateReference { .. })
        ));

        assert!(matches!(
            job.fail_sub_unit("eth", "again"),
            Err(JobError::AlreadyResolved { .. })
        ));
        assert_eq!(job.pending_len(), 2);
    }

    #[test]
    fn failed_reference_fails_every_pending_unit() {
        let mut job = job();
        let mut join = product;
        job.resolve_prerequisite("eth", 3, &mut join).unwrap();
        job.fail_sub_unit("sol", "timeout").unwrap();

        let report = job.fail_reference("btc series missing").unwrap().unwrap();
        assert_eq!(report.failed, 3);
        assert_eq!(report.failures[0].unit, "eth");
        assert_eq!(report.failures[0].cause, "reference unavailable: btc series missing");
        assert_eq!(report.failures[1].cause, "timeout");
    }

    #[test]
    fn job_without_sub_units_completes_on_reference() {
        let mut job: Job<i64, i64> = Job::new("empty", Vec::<String>::new());
        assert_eq!(job.pending_len(), 0);
        assert!(!job.is_completed());

        let report = job.resolve_reference(1, &mut product).unwrap().unwrap();
        assert_eq!(report.succeeded + report.failed, 0);
        assert!(job.is_completed());
    }

    #[test]
    fn unplanned_job_waits_for_its_sub_units() {
        let mut job: Job<i64, i64> = Job::unplanned("1d");
        let mut join = product;

        assert_eq!(job.resolve_reference(2, &mut join).unwrap(), None, "no sub-units known yet");
        assert!(!job.is_completed());
        assert!(!job.is_planned());

        assert_eq!(job.plan(["eth", "sol", "eth"]).unwrap(), None);
        assert_eq!(job.pending().collect::<Vec<_>>(), vec!["eth", "sol"]);
        assert_eq!(job.plan(["ada"]), Err(JobError::AlreadyPlanned { job: "1d".into() }));

        job.resolve_prerequisite("eth", 3, &mut join).unwrap();
        let report = job.resolve_prerequisite("sol", 4, &mut join).unwrap().unwrap();
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.error, None);
    }

    #[test]
    fn unplanned_job_with_empty_plan_completes_on_reference() {
        let mut job: Job<i64, i64> = Job::unplanned("1d");
        assert_eq!(job.plan(Vec::<String>::new()).unwrap(), None);
        assert!(job.resolve_reference(1, &mut product).unwrap().is_some());
    }

    #[test]
    fn units_planned_after_a_reference_failure_fail_at_once() {
        let mut job: Job<i64, i64> = Job::unplanned("1d");
        assert_eq!(job.fail_reference("btc series missing").unwrap(), None);
        assert!(matches!(
            job.fail_reference("again"),
            Err(JobError::DuplicateReference { .. })
        ));

        let report = job.plan(["eth", "sol"]).unwrap().unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.failures[1].unit, "sol");
        assert_eq!(report.failures[1].cause, "reference unavailable: btc series missing");
    }

    #[test]
    fn failed_plan_completes_with_a_job_error() {
        let mut job: Job<i64, i64> = Job::unplanned("1d");
        let report = job.fail_plan("listing offline").unwrap();
        assert_eq!(report.error.as_deref(), Some("sub-units unavailable: listing offline"));
        assert!(job.is_completed());
        assert!(matches!(
            job.resolve_reference(1, &mut product),
            Err(JobError::Completed { .. })
        ));

        let mut planned: Job<i64, i64> = Job::new("1h", ["eth"]);
        assert!(matches!(planned.fail_plan("late"), Err(JobError::AlreadyPlanned { .. })));
    }
}
