// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Internal events used between the runner components.
//!
//! These events often mirror those in [`crate::reporter::events`], but are
//! used within the runner, sent by the executor (the part that actually
//! runs subprocesses) to the dispatcher (the part that coordinates with the
//! external world).

use crate::{
    classify::UnitOutput,
    errors::InfraError,
    list::{ExpectedOutcome, TestUnit},
    reporter::events::{ExecuteStatus, ExecutionResult, RunPhase},
    stopwatch::StopwatchEnd,
};

#[derive(Debug)]
pub(super) enum ExecutorEvent<'a> {
    PhaseStarted {
        phase: RunPhase,
        queued: usize,
        test_threads: usize,
    },
    Started {
        test_unit: &'a TestUnit,
        attempt: usize,
    },
    Output {
        test_unit: &'a TestUnit,
        line: String,
    },
    Skipped {
        test_unit: &'a TestUnit,
        reason: String,
    },
    AttemptFailedWillRetry {
        test_unit: &'a TestUnit,
        run_status: ExecuteStatus,
    },
    RetryStarted {
        test_unit: &'a TestUnit,
    },
    Finished {
        test_unit: &'a TestUnit,
        run_status: ExecuteStatus,
    },
    InfraFailed {
        test_unit: &'a TestUnit,
        error: InfraError,
    },
}

/// Execution state owned by the unit's task until completion; result fields
/// transfer to the dispatcher through [`ExecutorEvent`]s.
#[derive(Debug)]
pub(super) struct InternalExecuteStatus {
    pub(super) result: ExecutionResult,
    pub(super) output: UnitOutput,
    pub(super) pid: Option<u32>,
    pub(super) exit_code: Option<i32>,
    pub(super) stopwatch_end: StopwatchEnd,
    pub(super) message: String,
}

impl InternalExecuteStatus {
    pub(super) fn into_external(self, attempt: usize, expected: ExpectedOutcome) -> ExecuteStatus {
        ExecuteStatus {
            attempt,
            result: self.result,
            expected,
            pid: self.pid,
            exit_code: self.exit_code,
            output: self.output,
            start_time: self.stopwatch_end.start_time,
            time_taken: self.stopwatch_end.duration,
            message: self.message,
        }
    }
}

/// Which attempt a unit task is executing, and whether a failing outcome
/// may be queued for the sequential retry.
///
/// Retries are exactly one extra attempt: the retry attempt itself runs
/// with `retry_allowed` unset, so a unit can appear on the retry list at
/// most once.
#[derive(Clone, Copy, Debug)]
pub(super) struct AttemptSpec {
    pub(super) attempt: usize,
    pub(super) retry_allowed: bool,
}

impl AttemptSpec {
    pub(super) fn first() -> Self {
        Self {
            attempt: 1,
            retry_allowed: true,
        }
    }

    pub(super) fn retry() -> Self {
        Self {
            attempt: 2,
            retry_allowed: false,
        }
    }
}

/// Request fanned out from the dispatcher to running unit tasks.
#[derive(Clone, Copy, Debug)]
pub(super) enum KillRequest {
    /// Forcibly terminate the unit's subprocess. The unit still completes
    /// normally, with the kill reflected in its exit status.
    Kill,
}
