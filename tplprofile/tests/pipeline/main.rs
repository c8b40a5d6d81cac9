//! Tests of the profiling pipeline, driving the mock compiler

mod fixture;

use assert_matches::assert_matches;
use fixture::PipelineTest;
use more_asserts::assert_lt;
use pretty_assertions::assert_eq;
use std::{
    path::Path,
    time::{Duration, Instant},
};
use tplprofile::{
    pipeline::{ResourceError, StageError},
    process::ProcessError,
    PipelineError, PipelineOutcome,
};

#[test]
fn end_to_end() {
    let finished = PipelineTest::new()
        .with_action("compile stderr instantiate B<long> cost=30")
        .with_action("compile stdout instantiate A<int> cost=50")
        .with_action("compile stderr unrelated noise")
        .start()
        .finish();
    let PipelineOutcome::Completed(report) = &finished.outcome else {
        panic!("Unexpected outcome {:?}", finished.outcome);
    };
    let ranking = report
        .ranked()
        .into_iter()
        .map(|record| (record.signature(), record.occurrences(), record.cost()))
        .collect::<Vec<_>>();
    assert_eq!(ranking, [("A<int>", 1, 50.0), ("B<long>", 1, 30.0)]);
    assert_eq!(
        finished.lines,
        [
            "Profiling instantiations in unit.cpp",
            "",
            "Instrumenting code...",
            "Instrumentation completed.",
            "Running profile...",
            "instantiate B<long> cost=30",
            "unrelated noise",
            "Profiling completed.",
            "Finalizing data...",
            "        cost    count  signature",
            "          50        1  A<int>",
            "          30        1  B<long>",
            "",
            "2 instantiations of 2 distinct templates",
            "Profile run completed.",
        ]
    );
    assert_eq!(finished.invocations, ["preprocess", "compile markers=1"]);
}

#[test]
fn aggregation() {
    let finished = PipelineTest::new()
        .with_action("compile stderr instantiate A<int> cost=10")
        .with_action("compile stderr instantiate A<  int > cost=15")
        .with_action("compile stderr instantiate A<int> cost=7")
        .start()
        .finish();
    let PipelineOutcome::Completed(report) = &finished.outcome else {
        panic!("Unexpected outcome {:?}", finished.outcome);
    };
    assert_eq!(report.len(), 1);
    let record = report.get("A<int>").expect("A<int> should have been recorded");
    assert_eq!((record.occurrences(), record.cost()), (3, 32.0));
}

#[test]
fn failing_compile_still_reports() {
    let finished = PipelineTest::new()
        .with_action("preprocess exit 1")
        .with_action("compile stderr instantiate X cost=5")
        .with_action("compile exit 1")
        .start()
        .finish();
    let PipelineOutcome::Completed(report) = &finished.outcome else {
        panic!("Unexpected outcome {:?}", finished.outcome);
    };
    assert_eq!(report.total_instantiations(), 1);
}

#[test]
fn canceled_before_start() {
    let finished = PipelineTest::new().canceled().start().finish();
    finished.assert_canceled();
    assert!(finished.invocations.is_empty());
    assert!(!finished.intermediate_dir_exists);
}

#[test]
fn missing_preprocess_output() {
    let finished = PipelineTest::new()
        .with_action("preprocess no-output")
        .start()
        .finish();
    assert_matches!(
        &finished.outcome,
        PipelineOutcome::Failed(PipelineError::Stage(StageError::PreprocessFailure(path)))
            if path == Path::new(PipelineTest::SOURCE)
    );
    assert_eq!(finished.invocations, ["preprocess"]);
    let last = finished.lines.last().expect("Failure should be reported");
    assert!(
        last.starts_with("Unable to preprocess unit.cpp") && last.contains("check that the file compiles"),
        "Unexpected failure line {last:?}"
    );
}

#[test]
fn stale_files_are_ignored() {
    let finished = PipelineTest::new()
        .with_stale_file("unit.instrumented", "template <class T> struct Stale {};")
        .with_stale_file("unit.template.profile", "instantiate Stale<int> cost=1000")
        .with_action("preprocess no-output")
        .start()
        .finish();
    assert_matches!(
        &finished.outcome,
        PipelineOutcome::Failed(PipelineError::Stage(StageError::PreprocessFailure(_)))
    );
    assert_eq!(finished.invocations, ["preprocess"]);
}

#[test]
fn stale_files_are_kept() {
    let finished = PipelineTest::new()
        .with_stale_file("unit.instrumented.o", "")
        .with_action("compile stderr instantiate A<int> cost=50")
        .start()
        .finish();
    let PipelineOutcome::Completed(report) = &finished.outcome else {
        panic!("Unexpected outcome {:?}", finished.outcome);
    };
    assert_eq!(report.len(), 1);
}

#[test]
fn cancel_mid_profile() {
    let running = PipelineTest::new()
        .with_action("compile stderr started")
        .with_action("compile sleep 30")
        .start();
    running.wait_for_line("started");
    let canceled = Instant::now();
    running.cancel();
    let finished = running.finish();
    assert_lt!(canceled.elapsed(), Duration::from_secs(5));
    finished.assert_canceled();
    assert!(!finished.lines.iter().any(|line| line == "Profiling completed."));
}

#[test]
fn drop_cancels() {
    let mut running = PipelineTest::new()
        .with_action("compile stderr started")
        .with_action("compile sleep 30")
        .start();
    running.wait_for_line("started");
    let dropped = Instant::now();
    running.drop_pipeline();
    assert_lt!(dropped.elapsed(), Duration::from_secs(5));
    running.finish().assert_canceled();
}

#[test]
fn spawn_failure() {
    let finished = PipelineTest::new()
        .with_invocation("this-compiler-does-not-exist --version")
        .start()
        .finish();
    assert_matches!(
        &finished.outcome,
        PipelineOutcome::Failed(PipelineError::Stage(StageError::Process(
            ProcessError::SpawnFailed { .. }
        )))
    );
}

#[test]
fn resource_exhaustion() {
    let finished = PipelineTest::new()
        .with_stack_reserve(usize::MAX / 4)
        .start()
        .finish();
    assert_matches!(
        &finished.outcome,
        PipelineOutcome::Failed(PipelineError::ResourceExhausted(
            ResourceError::ExceedsAvailable { .. } | ResourceError::ThreadSpawn { .. }
        ))
    );
    assert_eq!(finished.lines.len(), 1);
    assert!(
        finished.lines[0].starts_with("Not enough resources to start profiling"),
        "Unexpected failure line {:?}",
        finished.lines[0]
    );
    assert!(finished.invocations.is_empty());
    assert!(!finished.intermediate_dir_exists);
}
