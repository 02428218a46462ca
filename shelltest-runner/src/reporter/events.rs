// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events emitted over the course of a test run.
//!
//! Events are produced by a [`TestRunner`](crate::runner::TestRunner) and
//! consumed by reporters.

use crate::{
    classify::UnitOutput,
    errors::InfraError,
    list::{ExpectedOutcome, TestList, TestUnit},
};
use chrono::{DateTime, FixedOffset, Local};
use std::time::Duration;
use uuid::Uuid;

/// A test event.
#[derive(Clone, Debug)]
pub struct TestEvent<'a> {
    /// The time at which the event was generated, including the offset from
    /// UTC.
    pub timestamp: DateTime<FixedOffset>,

    /// The amount of time elapsed since the start of the run.
    pub elapsed: Duration,

    /// The kind of test event this is.
    pub kind: TestEventKind<'a>,
}

/// The kind of test event this is.
///
/// Forms part of [`TestEvent`].
#[derive(Clone, Debug)]
pub enum TestEventKind<'a> {
    /// The test run started.
    RunStarted {
        /// The list of tests that will be run.
        test_list: &'a TestList,

        /// The unique ID for this run.
        run_id: Uuid,
    },

    /// A scheduling phase started.
    PhaseStarted {
        /// The phase.
        phase: RunPhase,

        /// The number of units queued for this phase.
        queued: usize,

        /// The concurrency bound for this phase.
        test_threads: usize,
    },

    /// A test started running.
    TestStarted {
        /// The test unit.
        test_unit: &'a TestUnit,

        /// Which attempt this is (1 for the first, 2 for the retry).
        attempt: usize,

        /// Current run statistics.
        current_stats: RunStats,

        /// The number of tests currently running, including this one.
        running: usize,

        /// The cancel status of the run, if any.
        cancel_state: Option<CancelReason>,
    },

    /// One line of subprocess output, forwarded live in verbose mode.
    TestOutput {
        /// The test unit.
        test_unit: &'a TestUnit,

        /// The raw line.
        line: String,
    },

    /// A test was skipped.
    TestSkipped {
        /// The test unit.
        test_unit: &'a TestUnit,

        /// The reason it was skipped.
        reason: String,
    },

    /// A test attempt failed under concurrency and will be retried
    /// sequentially after the concurrent phase.
    ///
    /// This attempt's outcome does not count toward suite totals, and no
    /// terminal test-end record is emitted for it.
    TestAttemptFailedWillRetry {
        /// The test unit.
        test_unit: &'a TestUnit,

        /// The status of the failed attempt. Never a success.
        run_status: ExecuteStatus,
    },

    /// A retry has started.
    TestRetryStarted {
        /// The test unit.
        test_unit: &'a TestUnit,
    },

    /// A test finished running; its outcome is final.
    TestFinished {
        /// The test unit.
        test_unit: &'a TestUnit,

        /// The status of the final attempt.
        run_status: ExecuteStatus,

        /// Current run statistics.
        current_stats: RunStats,

        /// The number of tests still running, excluding this one.
        running: usize,

        /// The cancel status of the run, if any.
        cancel_state: Option<CancelReason>,
    },

    /// An infrastructure error occurred while executing a test.
    ///
    /// No further units are dispatched after this; the error is re-raised
    /// to the caller once in-flight units finish.
    TestInfraFailed {
        /// The test unit.
        test_unit: &'a TestUnit,

        /// The error.
        error: InfraError,
    },

    /// A cancellation notice was received.
    RunBeginCancel {
        /// The number of tests still running.
        running: usize,

        /// The reason the run is being cancelled.
        reason: CancelReason,
    },

    /// The test run finished.
    RunFinished {
        /// The unique ID for this run.
        run_id: Uuid,

        /// The time at which the run started.
        start_time: DateTime<FixedOffset>,

        /// The amount of time the run took.
        elapsed: Duration,

        /// Statistics for the run.
        run_stats: RunStats,
    },
}

/// A scheduling phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunPhase {
    /// The concurrent queue is being drained.
    Concurrent,

    /// Sequential-only units run one at a time, in queue order.
    Sequential,

    /// Units that failed under concurrency get their single sequential
    /// retry.
    Retry,
}

// Note: the order here matters -- it indicates severity of cancellation.
/// The reason why a test run is being cancelled.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CancelReason {
    /// An infrastructure error halted dispatch.
    InfraFailure,

    /// A termination signal (on Unix, SIGTERM or SIGHUP) was received.
    Signal,

    /// An interrupt (on Unix, Ctrl-C) was received.
    Interrupt,
}

impl CancelReason {
    pub(crate) fn to_static_str(self) -> &'static str {
        match self {
            CancelReason::InfraFailure => "infrastructure failure",
            CancelReason::Signal => "signal",
            CancelReason::Interrupt => "interrupt",
        }
    }
}

/// The terminal outcome of one execution attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExecutionResult {
    /// The process exited cleanly with no failure evidence.
    Pass,

    /// The process exited nonzero or produced failure evidence.
    Fail,

    /// The watchdog killed the process.
    ///
    /// Reported as [`Fail`](Self::Fail) instead when `timeout_as_pass` is
    /// configured.
    Timeout,

    /// The process exited cleanly but without the expected
    /// crash-reporter-initialized marker: an early crash.
    Crash,

    /// The harness could not execute the unit.
    ExecFail,
}

impl ExecutionResult {
    /// Returns true if the attempt was successful.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Pass)
    }

    /// Whether a failing attempt with this result is eligible for the
    /// sequential retry. Early crashes and infrastructure failures are
    /// terminal.
    pub(crate) fn retry_eligible(self) -> bool {
        matches!(self, Self::Fail | Self::Timeout)
    }

    /// The status string used in log records.
    pub fn status_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Timeout => "TIMEOUT",
            Self::Crash => "CRASH",
            Self::ExecFail => "ERROR",
        }
    }
}

/// Information about a single execution attempt of a unit.
#[derive(Clone, Debug)]
pub struct ExecuteStatus {
    /// Which attempt this was (1 for the first, 2 for the retry).
    pub attempt: usize,

    /// The terminal outcome.
    pub result: ExecutionResult,

    /// The outcome the unit was expected to produce.
    pub expected: ExpectedOutcome,

    /// The process identifier, for diagnostics.
    pub pid: Option<u32>,

    /// The process exit code, if it exited normally.
    pub exit_code: Option<i32>,

    /// Buffered output, in arrival order.
    pub output: UnitOutput,

    /// When the attempt started.
    pub start_time: DateTime<Local>,

    /// How long the attempt took.
    pub time_taken: Duration,

    /// A one-line description of the outcome.
    pub message: String,
}

impl ExecuteStatus {
    /// Whether the outcome differs from the expectation. Timeouts, crashes
    /// and execution failures are always unexpected.
    pub fn is_unexpected(&self) -> bool {
        match self.result {
            ExecutionResult::Pass => self.expected == ExpectedOutcome::Fail,
            ExecutionResult::Fail => self.expected == ExpectedOutcome::Pass,
            ExecutionResult::Timeout | ExecutionResult::Crash | ExecutionResult::ExecFail => true,
        }
    }
}

/// Statistics for a test run.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct RunStats {
    /// The total number of units queued at the beginning of the run.
    ///
    /// If the run is cancelled this will be more than the number that
    /// finished.
    pub initial_run_count: usize,

    /// The number of units whose outcome is final.
    pub finished_count: usize,

    /// The number of units that passed as expected.
    pub passed: usize,

    /// The number of units with an unexpected outcome: failures, unexpected
    /// passes, timeouts and crashes.
    pub failed: usize,

    /// The number of known failures that indeed failed.
    pub todo: usize,

    /// The number of units killed by the watchdog (also counted in
    /// `failed`).
    pub timed_out: usize,

    /// The number of early crashes (also counted in `failed`).
    pub crashed: usize,

    /// The number of units the harness could not execute.
    pub exec_failed: usize,

    /// The number of units skipped as disabled.
    pub skipped: usize,

    /// The number of units queued for a sequential retry.
    pub retried: usize,
}

impl RunStats {
    /// Returns true if any unit had an unexpected outcome or could not be
    /// executed.
    pub fn any_failed(&self) -> bool {
        self.failed > 0 || self.exec_failed > 0
    }

    /// Determines whether the suite as a whole failed.
    ///
    /// In `run_failures` mode the condition is inverted: a run of known
    /// failures that produces zero failures is itself the failure. An empty
    /// run outside automation also fails, to protect against silently-empty
    /// runs.
    pub fn suite_failed(&self, automation: bool, run_failures: bool) -> bool {
        if self.exec_failed > 0 {
            return true;
        }
        // A cancelled run left units unaccounted for.
        if self.finished_count + self.skipped < self.initial_run_count {
            return true;
        }
        if run_failures {
            return self.failed == 0;
        }
        if self.failed > 0 {
            return true;
        }
        self.initial_run_count == 0 && !automation
    }

    pub(crate) fn on_test_finished(&mut self, status: &ExecuteStatus) {
        self.finished_count += 1;
        match status.result {
            ExecutionResult::Pass => {
                if status.expected == ExpectedOutcome::Fail {
                    // An unexpected pass is a failure of the expectation.
                    self.failed += 1;
                } else {
                    self.passed += 1;
                }
            }
            ExecutionResult::Fail => {
                if status.expected == ExpectedOutcome::Fail {
                    self.todo += 1;
                } else {
                    self.failed += 1;
                }
            }
            ExecutionResult::Timeout => {
                self.failed += 1;
                self.timed_out += 1;
            }
            ExecutionResult::Crash => {
                self.failed += 1;
                self.crashed += 1;
            }
            ExecutionResult::ExecFail => {
                self.exec_failed += 1;
            }
        }
    }
}
