// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests driving the runner against real `sh` subprocesses.

#![cfg(unix)]

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use shelltest_runner::{
    config::{RetryPolicy, SuiteConfig, SuiteConfigBuilder, TestThreads},
    errors::InfraErrors,
    list::{ExpectedOutcome, ListSettings, Manifest, TestDef, TestList},
    process::LocalLauncher,
    reporter::events::{CancelReason, ExecutionResult, RunStats, TestEventKind},
    runner::TestRunnerBuilder,
};
use std::time::{Duration, Instant};

/// A flattened, owned record of one reporter event.
#[derive(Clone, Debug, Eq, PartialEq)]
enum Rec {
    Started { id: String, running: usize },
    Skipped { id: String },
    WillRetry { id: String },
    RetryStarted { id: String },
    Finished { id: String, result: ExecutionResult, attempt: usize },
    InfraFailed { id: String },
    BeginCancel { reason: CancelReason },
}

fn config_builder() -> SuiteConfigBuilder {
    let mut builder = SuiteConfigBuilder::new("sh");
    builder
        .set_test_threads(TestThreads::Count(4))
        // Deterministic regardless of the environment the tests run in.
        .set_automation(false)
        .set_retries(RetryPolicy::Never)
        .set_harness_timeout(Duration::from_secs(60));
    builder
}

fn write_script(dir: &Utf8Path, name: &str, contents: &str) -> Utf8PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("wrote script");
    path
}

fn run_suite(
    config: &SuiteConfig,
    defs: Vec<TestDef>,
) -> (Result<RunStats, InfraErrors>, Vec<Rec>) {
    let manifest = Manifest { tests: defs };
    let test_list = TestList::new(manifest, &ListSettings::default());
    let runner = TestRunnerBuilder::default()
        .build(&test_list, config, LocalLauncher)
        .expect("built runner");

    let mut recs = Vec::new();
    let result = runner.execute(|event| {
        let rec = match event.kind {
            TestEventKind::TestStarted {
                test_unit, running, ..
            } => Some(Rec::Started {
                id: test_unit.id.to_string(),
                running,
            }),
            TestEventKind::TestSkipped { test_unit, .. } => Some(Rec::Skipped {
                id: test_unit.id.to_string(),
            }),
            TestEventKind::TestAttemptFailedWillRetry { test_unit, .. } => Some(Rec::WillRetry {
                id: test_unit.id.to_string(),
            }),
            TestEventKind::TestRetryStarted { test_unit } => Some(Rec::RetryStarted {
                id: test_unit.id.to_string(),
            }),
            TestEventKind::TestFinished {
                test_unit,
                ref run_status,
                ..
            } => Some(Rec::Finished {
                id: test_unit.id.to_string(),
                result: run_status.result,
                attempt: run_status.attempt,
            }),
            TestEventKind::TestInfraFailed { test_unit, .. } => Some(Rec::InfraFailed {
                id: test_unit.id.to_string(),
            }),
            TestEventKind::RunBeginCancel { reason, .. } => {
                Some(Rec::BeginCancel { reason })
            }
            _ => None,
        };
        if let Some(rec) = rec {
            recs.push(rec);
        }
    });
    (result, recs)
}

fn def(path: &Utf8Path) -> TestDef {
    TestDef::new(path)
}

// Scenario A: three passing units.
#[test]
fn all_tests_pass() {
    let dir = Utf8TempDir::new().unwrap();
    let defs = (0..3)
        .map(|i| def(&write_script(dir.path(), &format!("t{i}.sh"), "exit 0\n")))
        .collect();

    let (result, recs) = run_suite(&config_builder().build(), defs);
    let stats = result.expect("no infra errors");
    assert_eq!(stats.passed, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.finished_count, 3);
    assert!(!stats.suite_failed(false, false));
    assert_eq!(
        recs.iter()
            .filter(|rec| matches!(rec, Rec::Finished { result: ExecutionResult::Pass, .. }))
            .count(),
        3
    );
}

// Scenario B: an expected failure that fails is a todo, not a pass.
#[test]
fn expected_failure_counts_as_todo() {
    let dir = Utf8TempDir::new().unwrap();
    let mut failing = def(&write_script(dir.path(), "known_fail.sh", "exit 1\n"));
    failing.expected = ExpectedOutcome::Fail;

    let (result, _) = run_suite(&config_builder().build(), vec![failing]);
    let stats = result.unwrap();
    assert_eq!(stats.todo, 1);
    assert_eq!(stats.passed, 0);
    assert_eq!(stats.failed, 0);
    assert!(!stats.suite_failed(false, false));
}

#[test]
fn unexpected_pass_is_a_failure() {
    let dir = Utf8TempDir::new().unwrap();
    let mut unit = def(&write_script(dir.path(), "fixed.sh", "exit 0\n"));
    unit.expected = ExpectedOutcome::Fail;

    let (result, recs) = run_suite(&config_builder().build(), vec![unit]);
    let stats = result.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.passed, 0);
    assert!(stats.suite_failed(false, false));
    assert!(matches!(
        recs.last(),
        Some(Rec::Finished {
            result: ExecutionResult::Pass,
            ..
        })
    ));
}

// Scenario C: a unit exceeding its timeout is killed and counted failed.
#[test]
fn timeout_kills_the_process() {
    let dir = Utf8TempDir::new().unwrap();
    let unit = def(&write_script(dir.path(), "hang.sh", "exec sleep 30\n"));

    let mut builder = config_builder();
    builder.set_harness_timeout(Duration::from_secs(1));
    let started = Instant::now();
    let (result, recs) = run_suite(&builder.build(), vec![unit]);
    let stats = result.unwrap();

    assert!(
        started.elapsed() < Duration::from_secs(20),
        "the watchdog must fire well before the sleep finishes"
    );
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.timed_out, 1);
    assert!(matches!(
        recs.last(),
        Some(Rec::Finished {
            result: ExecutionResult::Timeout,
            ..
        })
    ));
}

#[test]
fn timeout_as_pass_downgrades_to_fail() {
    let dir = Utf8TempDir::new().unwrap();
    let unit = def(&write_script(dir.path(), "hang.sh", "exec sleep 30\n"));

    let mut builder = config_builder();
    builder
        .set_harness_timeout(Duration::from_secs(1))
        .set_timeout_as_pass(true);
    let (result, recs) = run_suite(&builder.build(), vec![unit]);
    let stats = result.unwrap();

    // Downgraded to an ordinary failure, never to a pass.
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.timed_out, 0);
    assert!(matches!(
        recs.last(),
        Some(Rec::Finished {
            result: ExecutionResult::Fail,
            ..
        })
    ));
}

// Scenario D: a unit failing under concurrency is retried sequentially and
// its passing retry is what counts.
#[test]
fn flaky_test_passes_on_retry() {
    let dir = Utf8TempDir::new().unwrap();
    let marker = dir.path().join("marker");
    let script = write_script(
        dir.path(),
        "flaky.sh",
        &format!("if [ -f {marker} ]; then exit 0; else touch {marker}; exit 1; fi\n"),
    );

    let mut builder = config_builder();
    builder.set_retries(RetryPolicy::Always);
    let (result, recs) = run_suite(&builder.build(), vec![def(&script)]);
    let stats = result.unwrap();

    assert_eq!(stats.passed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.finished_count, 1);

    let id = script.as_str().to_owned();
    assert!(recs.contains(&Rec::WillRetry { id: id.clone() }));
    assert!(recs.contains(&Rec::RetryStarted { id: id.clone() }));
    assert!(matches!(
        recs.last(),
        Some(Rec::Finished {
            result: ExecutionResult::Pass,
            attempt: 2,
            ..
        })
    ));
}

// Retry-once law: a retry that fails again is terminal.
#[test]
fn failing_retry_is_terminal() {
    let dir = Utf8TempDir::new().unwrap();
    let unit = def(&write_script(dir.path(), "bad.sh", "exit 1\n"));

    let mut builder = config_builder();
    builder.set_retries(RetryPolicy::Always);
    let (result, recs) = run_suite(&builder.build(), vec![unit]);
    let stats = result.unwrap();

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retried, 1);
    // Exactly one retry: one will-retry record, one terminal finish.
    assert_eq!(
        recs.iter()
            .filter(|rec| matches!(rec, Rec::WillRetry { .. }))
            .count(),
        1
    );
    assert_eq!(
        recs.iter()
            .filter(|rec| matches!(rec, Rec::Finished { .. }))
            .count(),
        1
    );
}

// Scenario E: an infrastructure error stops new dispatch and is re-raised.
#[test]
fn infra_error_aborts_dispatch() {
    let dir = Utf8TempDir::new().unwrap();
    let defs: Vec<_> = (0..3)
        .map(|i| def(&write_script(dir.path(), &format!("t{i}.sh"), "exit 0\n")))
        .collect();

    let mut builder = SuiteConfigBuilder::new("/nonexistent/shelltest-no-such-program");
    builder
        .set_test_threads(TestThreads::Count(1))
        .set_automation(false)
        .set_retries(RetryPolicy::Never);
    let (result, recs) = run_suite(&builder.build(), defs);

    let errors = result.expect_err("spawn failures are infrastructure errors");
    assert_eq!(errors.errors().len(), 1);

    let started = recs
        .iter()
        .filter(|rec| matches!(rec, Rec::Started { .. }))
        .count();
    assert_eq!(started, 1, "no new units after the infra failure: {recs:?}");
    assert!(recs.contains(&Rec::BeginCancel {
        reason: CancelReason::InfraFailure
    }));
    assert_eq!(
        recs.iter()
            .filter(|rec| matches!(rec, Rec::InfraFailed { .. }))
            .count(),
        1
    );
}

#[test]
fn disabled_units_are_skipped() {
    let dir = Utf8TempDir::new().unwrap();
    let mut disabled = def(&write_script(dir.path(), "off.sh", "exit 1\n"));
    disabled.disabled = Some("tracked in issue 123".to_owned());
    let passing = def(&write_script(dir.path(), "on.sh", "exit 0\n"));

    let (result, recs) = run_suite(&config_builder().build(), vec![disabled, passing]);
    let stats = result.unwrap();

    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.passed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.finished_count, 1);
    assert!(!stats.suite_failed(false, false));
    assert!(
        recs.iter()
            .any(|rec| matches!(rec, Rec::Skipped { id } if id.ends_with("off.sh")))
    );
}

#[test]
fn error_log_record_fails_a_clean_exit() {
    let dir = Utf8TempDir::new().unwrap();
    let script = write_script(
        dir.path(),
        "lies.sh",
        "echo '{\"action\": \"log\", \"level\": \"ERROR\", \"message\": \"assertion failed\"}'\nexit 0\n",
    );

    let (result, recs) = run_suite(&config_builder().build(), vec![def(&script)]);
    let stats = result.unwrap();
    assert_eq!(stats.failed, 1);
    assert!(matches!(
        recs.last(),
        Some(Rec::Finished {
            result: ExecutionResult::Fail,
            ..
        })
    ));
}

#[test]
fn crash_reporter_marker_is_required_when_enabled() {
    let dir = Utf8TempDir::new().unwrap();
    let without_marker = def(&write_script(
        dir.path(),
        "no_marker.sh",
        "echo starting up\nexit 0\n",
    ));
    let with_marker = def(&write_script(
        dir.path(),
        "with_marker.sh",
        "echo '{\"action\": \"crash_reporter_init\"}'\necho starting up\nexit 0\n",
    ));

    let mut builder = config_builder();
    builder.set_crash_reporter(true);
    let config = builder.build();

    let (result, recs) = run_suite(&config, vec![without_marker]);
    let stats = result.unwrap();
    assert_eq!(stats.crashed, 1);
    assert_eq!(stats.failed, 1);
    assert!(matches!(
        recs.last(),
        Some(Rec::Finished {
            result: ExecutionResult::Crash,
            ..
        })
    ));

    let (result, _) = run_suite(&config, vec![with_marker]);
    let stats = result.unwrap();
    assert_eq!(stats.passed, 1);
    assert_eq!(stats.crashed, 0);
}

#[test]
fn race_detector_sentinel_exit_code() {
    let dir = Utf8TempDir::new().unwrap();
    let unit = def(&write_script(dir.path(), "racy.sh", "exit 66\n"));

    let mut builder = config_builder();
    builder.set_race_detector(true);
    let (result, _) = run_suite(&builder.build(), vec![unit.clone()]);
    assert_eq!(result.unwrap().passed, 1);

    // Without a race-detector build, 66 is an ordinary failure.
    let (result, _) = run_suite(&config_builder().build(), vec![unit]);
    assert_eq!(result.unwrap().failed, 1);
}

#[test]
fn sequential_units_preserve_queue_order() {
    let dir = Utf8TempDir::new().unwrap();
    let log = dir.path().join("order.log");
    let defs: Vec<_> = ["first", "second", "third"]
        .iter()
        .map(|name| {
            let script = write_script(
                dir.path(),
                &format!("{name}.sh"),
                &format!("echo {name} >> {log}\n"),
            );
            let mut def = def(&script);
            def.run_sequentially = true;
            def
        })
        .collect();

    let (result, _) = run_suite(&config_builder().build(), defs);
    assert_eq!(result.unwrap().passed, 3);

    let contents = std::fs::read_to_string(&log).expect("order log written");
    let order: Vec<_> = contents.split_whitespace().collect();
    assert_eq!(order, ["first", "second", "third"]);
}

#[test]
fn concurrency_bound_is_respected() {
    let dir = Utf8TempDir::new().unwrap();
    let defs: Vec<_> = (0..6)
        .map(|i| def(&write_script(dir.path(), &format!("t{i}.sh"), "sleep 0.1\n")))
        .collect();

    let mut builder = config_builder();
    builder.set_test_threads(TestThreads::Count(2));
    let (result, recs) = run_suite(&builder.build(), defs);
    assert_eq!(result.unwrap().passed, 6);

    for rec in &recs {
        if let Rec::Started { running, .. } = rec {
            assert!(
                *running <= 2,
                "never more than two live units, got {running}: {recs:?}"
            );
        }
    }
}

#[test]
fn forced_sequential_mode_runs_everything_in_order() {
    let dir = Utf8TempDir::new().unwrap();
    let log = dir.path().join("order.log");
    let defs: Vec<_> = (0..4)
        .map(|i| {
            def(&write_script(
                dir.path(),
                &format!("t{i}.sh"),
                &format!("echo t{i} >> {log}\n"),
            ))
        })
        .collect();

    let mut builder = config_builder();
    builder.set_sequential(true);
    let (result, _) = run_suite(&builder.build(), defs);
    assert_eq!(result.unwrap().passed, 4);

    let contents = std::fs::read_to_string(&log).expect("order log written");
    let order: Vec<_> = contents.split_whitespace().collect();
    assert_eq!(order, ["t0", "t1", "t2", "t3"]);
}

#[test]
fn harness_env_vars_are_set() {
    let dir = Utf8TempDir::new().unwrap();
    let script = write_script(
        dir.path(),
        "env.sh",
        concat!(
            "[ -d \"$SHELLTEST_TEMP_DIR\" ] || exit 1\n",
            "[ -d \"$SHELLTEST_PROFILE_DIR\" ] || exit 2\n",
            "[ -f \"$SHELLTEST_PREFS_FILE\" ] || exit 3\n",
            "[ -n \"$SHELLTEST_TIMEOUT_SECS\" ] || exit 4\n",
            "exit 0\n",
        ),
    );
    let mut unit = def(&script);
    unit.prefs.insert("some.pref".to_owned(), "1".to_owned());

    let (result, _) = run_suite(&config_builder().build(), vec![unit]);
    assert_eq!(result.unwrap().passed, 1);
}

#[test]
fn repeat_forces_extra_runs() {
    let dir = Utf8TempDir::new().unwrap();
    let log = dir.path().join("runs.log");
    let script = write_script(dir.path(), "counted.sh", &format!("echo run >> {log}\n"));

    let manifest = Manifest {
        tests: vec![def(&script)],
    };
    let test_list = TestList::new(
        manifest,
        &ListSettings {
            repeat: 2,
            ..ListSettings::default()
        },
    );
    // Selecting a repeat count implies a sequential run.
    let mut builder = config_builder();
    builder.set_sequential(true);
    let config = builder.build();
    let runner = TestRunnerBuilder::default()
        .build(&test_list, &config, LocalLauncher)
        .expect("built runner");
    let stats = runner.execute(|_event| {}).expect("no infra errors");

    assert_eq!(stats.passed, 3);
    let contents = std::fs::read_to_string(&log).expect("log written");
    assert_eq!(contents.split_whitespace().count(), 3);
}
