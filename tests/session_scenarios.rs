//! Session behaviour driven by hand-published events, without agents.

mod common;

use common::{count, keep, plan, presenter, trace};
use pipevisor::{Bus, CorrelationKey, FinalResults, Session, Validator, contract};
use serde_json::json;

fn completed(job: &str, unit: Option<&str>, value: i64) -> pipevisor::Event {
    let key = match unit {
        Some(unit) => CorrelationKey::sub_unit(job, unit),
        None => CorrelationKey::reference(job),
    };
    let kind = if unit.is_some() { "prices" } else { "reference" };
    contract::work_completed("fetch", key, kind, json!(value))
}

async fn run_with(arrivals: Vec<pipevisor::Event>) -> (FinalResults, common::Trace) {
    let (bus, dispatcher) = Bus::new(Validator::with_contracts());
    let (session, done) = Session::new(
        "r1",
        vec![plan("1h", &["eth", "sol", "ada"]), plan("4h", &["eth", "sol", "ada"])],
        keep,
    );
    session.subscribe(&bus).unwrap();
    let seen = trace(&bus, &[contract::JOB_COMPLETED, contract::FINAL_RESULTS_READY]);
    presenter(&bus);
    let join = dispatcher.spawn();

    bus.publish(contract::run_requested("test", "r1"));
    for ev in arrivals {
        bus.publish(ev);
    }

    let results = done.await.expect("session finished");
    bus.shutdown();
    join.await.unwrap();
    assert!(bus.diagnostics().snapshot().is_empty(), "{:?}", bus.diagnostics().snapshot());
    (results, seen)
}

#[tokio::test]
async fn two_jobs_with_mixed_arrivals_complete_independently() {
    let arrivals = vec![
        completed("1h", None, 100),
        completed("4h", None, 400),
        completed("4h", Some("sol"), 42),
        completed("1h", Some("ada"), 13),
        completed("4h", Some("eth"), 41),
        completed("1h", Some("eth"), 11),
        completed("4h", Some("ada"), 43),
        completed("1h", Some("sol"), 12),
    ];
    let (results, seen) = run_with(arrivals).await;

    // 4h resolves its last sub-unit first.
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["JobCompleted", "JobCompleted", "FinalResultsReady"]
    );
    assert_eq!(count(&seen, "FinalResultsReady"), 1);

    assert_eq!(results.run_id, "r1");
    let ids: Vec<_> = results.jobs.iter().map(|j| j.job.as_str()).collect();
    assert_eq!(ids, vec!["1h", "4h"], "jobs reported in plan order");
    for job in &results.jobs {
        assert_eq!(job.succeeded, 3);
        assert_eq!(job.failed, 0);
        let units: Vec<_> = job.results.iter().map(|r| r.unit.as_str()).collect();
        assert_eq!(units, vec!["eth", "sol", "ada"]);
    }
    assert_eq!(results.jobs[1].results[0].output, json!(41));
}

#[tokio::test]
async fn prerequisites_before_references_give_the_same_outcome() {
    let early = vec![
        completed("1h", Some("eth"), 11),
        completed("4h", Some("eth"), 41),
        completed("1h", Some("sol"), 12),
        completed("4h", Some("sol"), 42),
        completed("1h", Some("ada"), 13),
        completed("4h", Some("ada"), 43),
        completed("1h", None, 100),
        completed("4h", None, 400),
    ];
    let late = vec![
        completed("4h", None, 400),
        completed("1h", None, 100),
        completed("1h", Some("ada"), 13),
        completed("4h", Some("ada"), 43),
        completed("1h", Some("sol"), 12),
        completed("4h", Some("eth"), 41),
        completed("4h", Some("sol"), 42),
        completed("1h", Some("eth"), 11),
    ];

    let (a, _) = run_with(early).await;
    let (b, _) = run_with(late).await;
    assert_eq!(a, b);
}

#[tokio::test]
async fn failures_are_reported_with_their_cause() {
    let arrivals = vec![
        completed("1h", None, 100),
        contract::work_failed(
            "fetch",
            CorrelationKey::sub_unit("1h", "sol"),
            "prices",
            "symbol not listed",
        ),
        completed("1h", Some("eth"), 11),
        completed("1h", Some("ada"), 13),
        contract::work_failed("fetch", CorrelationKey::reference("4h"), "reference", "btc series missing"),
    ];
    let (results, seen) = run_with(arrivals).await;

    assert_eq!(count(&seen, "JobCompleted"), 2);
    let h1 = &results.jobs[0];
    assert_eq!((h1.succeeded, h1.failed), (2, 1));
    assert_eq!(h1.failures[0].unit, "sol");
    assert_eq!(h1.failures[0].cause, "symbol not listed");

    let h4 = &results.jobs[1];
    assert_eq!((h4.succeeded, h4.failed), (0, 3));
    assert!(h4.failures.iter().all(|f| f.cause.contains("btc series missing")));
    assert_eq!(
        results.failures_value().as_array().map(Vec::len),
        Some(4),
        "flat failure list spans both jobs"
    );
}
