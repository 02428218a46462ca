// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The controller for the test runner.
//!
//! This module interfaces with the external world and the executor. It
//! receives events from the executor and from signal handling, folds
//! outcomes into the suite-level aggregate, and forwards reporter events to
//! the callback. It is the only writer of [`RunStats`], the retried-unit
//! list and the collected infrastructure errors: workers hand results over
//! through the event channel and never touch the aggregate directly.

use super::internal_events::{ExecutorEvent, KillRequest};
use crate::{
    errors::InfraError,
    list::{TestId, TestList},
    reporter::events::{CancelReason, RunStats, TestEvent, TestEventKind},
    signal::{ShutdownEvent, SignalEvent, SignalHandler},
    stopwatch::StopwatchStart,
};
use chrono::Local;
use debug_ignore::DebugIgnore;
use std::{
    collections::BTreeSet,
    marker::PhantomData,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::sync::{broadcast, mpsc::UnboundedReceiver};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug)]
pub(super) struct DispatcherContext<'a, F> {
    callback: DebugIgnore<F>,
    run_id: Uuid,
    stopwatch: StopwatchStart,
    run_stats: RunStats,
    running: usize,
    finished: BTreeSet<usize>,
    retried_units: Vec<TestId>,
    infra_errors: Vec<InfraError>,
    cancel_state: Option<CancelReason>,
    signal_count: Option<SignalCount>,
    sequential_mode: bool,
    keep_going: bool,
    phantom: PhantomData<&'a ()>,
}

impl<'a, F> DispatcherContext<'a, F>
where
    F: FnMut(TestEvent<'a>) + Send,
{
    pub(super) fn new(
        callback: F,
        run_id: Uuid,
        initial_run_count: usize,
        sequential_mode: bool,
        keep_going: bool,
    ) -> Self {
        Self {
            callback: DebugIgnore(callback),
            run_id,
            stopwatch: StopwatchStart::now(),
            run_stats: RunStats {
                initial_run_count,
                ..RunStats::default()
            },
            running: 0,
            finished: BTreeSet::new(),
            retried_units: Vec::new(),
            infra_errors: Vec::new(),
            cancel_state: None,
            signal_count: None,
            sequential_mode,
            keep_going,
            phantom: PhantomData,
        }
    }

    /// Runs the dispatcher to completion, until `executor_rx` is closed.
    ///
    /// This is the reconciliation step: it is expected to be spawned as a
    /// task alongside the executor, and is the single writer of the
    /// aggregate state.
    pub(super) async fn run(
        &mut self,
        mut executor_rx: UnboundedReceiver<ExecutorEvent<'a>>,
        signal_handler: &mut SignalHandler,
        cancelled_ref: &AtomicBool,
        kill_sender: broadcast::Sender<KillRequest>,
    ) {
        let mut signals_done = false;
        loop {
            let internal_event = tokio::select! {
                internal_event = executor_rx.recv() => {
                    match internal_event {
                        Some(event) => InternalEvent::Executor(event),
                        None => {
                            // All runs have been completed.
                            break;
                        }
                    }
                },
                internal_event = signal_handler.recv(), if !signals_done => {
                    match internal_event {
                        Some(event) => InternalEvent::Signal(event),
                        None => {
                            signals_done = true;
                            continue;
                        }
                    }
                },
            };

            match self.handle_event(internal_event) {
                HandleEventResponse::None => {}
                HandleEventResponse::KillRunning => {
                    // Ignore errors: no live receivers means nothing to
                    // kill.
                    let _ = kill_sender.send(KillRequest::Kill);
                }
                HandleEventResponse::Cancel(reason) => {
                    // Note the ordering: the flag is set before any kill is
                    // broadcast, so tasks that observe the kill also
                    // observe the flag.
                    cancelled_ref.store(true, Ordering::Release);
                    if matches!(reason, CancelReason::Signal | CancelReason::Interrupt) {
                        let _ = kill_sender.send(KillRequest::Kill);
                    }
                }
            }
        }
    }

    pub(super) fn run_started(&mut self, test_list: &'a TestList) {
        self.basic_callback(TestEventKind::RunStarted {
            test_list,
            run_id: self.run_id,
        });
    }

    pub(super) fn run_finished(&mut self) {
        let stopwatch_end = self.stopwatch.end();
        self.basic_callback(TestEventKind::RunFinished {
            run_id: self.run_id,
            start_time: stopwatch_end.start_time.fixed_offset(),
            elapsed: stopwatch_end.duration,
            run_stats: self.run_stats,
        });
    }

    pub(super) fn run_stats(&self) -> RunStats {
        self.run_stats
    }

    /// Ids of the units that were queued for a retry, in the order they
    /// were queued.
    pub(super) fn retried_units(&self) -> &[TestId] {
        &self.retried_units
    }

    pub(super) fn take_infra_errors(&mut self) -> Vec<InfraError> {
        std::mem::take(&mut self.infra_errors)
    }

    #[inline]
    fn basic_callback(&mut self, kind: TestEventKind<'a>) {
        let event = TestEvent {
            timestamp: Local::now().fixed_offset(),
            elapsed: self.stopwatch.elapsed(),
            kind,
        };
        (self.callback.0)(event);
    }

    fn handle_event(&mut self, event: InternalEvent<'a>) -> HandleEventResponse {
        match event {
            InternalEvent::Executor(ExecutorEvent::PhaseStarted {
                phase,
                queued,
                test_threads,
            }) => {
                self.basic_callback(TestEventKind::PhaseStarted {
                    phase,
                    queued,
                    test_threads,
                });
                HandleEventResponse::None
            }
            InternalEvent::Executor(ExecutorEvent::Started { test_unit, attempt }) => {
                self.running += 1;
                self.basic_callback(TestEventKind::TestStarted {
                    test_unit,
                    attempt,
                    current_stats: self.run_stats,
                    running: self.running,
                    cancel_state: self.cancel_state,
                });
                HandleEventResponse::None
            }
            InternalEvent::Executor(ExecutorEvent::Output { test_unit, line }) => {
                self.basic_callback(TestEventKind::TestOutput { test_unit, line });
                HandleEventResponse::None
            }
            InternalEvent::Executor(ExecutorEvent::Skipped { test_unit, reason }) => {
                self.run_stats.skipped += 1;
                self.basic_callback(TestEventKind::TestSkipped { test_unit, reason });
                HandleEventResponse::None
            }
            InternalEvent::Executor(ExecutorEvent::AttemptFailedWillRetry {
                test_unit,
                run_status,
            }) => {
                self.running -= 1;
                // The failed attempt's counts are discarded; only the final
                // attempt contributes to suite totals.
                self.run_stats.retried += 1;
                self.retried_units.push(test_unit.id.clone());
                self.basic_callback(TestEventKind::TestAttemptFailedWillRetry {
                    test_unit,
                    run_status,
                });
                HandleEventResponse::None
            }
            InternalEvent::Executor(ExecutorEvent::RetryStarted { test_unit }) => {
                self.basic_callback(TestEventKind::TestRetryStarted { test_unit });
                HandleEventResponse::None
            }
            InternalEvent::Executor(ExecutorEvent::Finished {
                test_unit,
                run_status,
            }) => {
                self.running -= 1;
                assert!(
                    self.finished.insert(test_unit.index),
                    "unit {} (index {}) finished twice",
                    test_unit.id,
                    test_unit.index,
                );
                self.run_stats.on_test_finished(&run_status);
                self.basic_callback(TestEventKind::TestFinished {
                    test_unit,
                    run_status,
                    current_stats: self.run_stats,
                    running: self.running,
                    cancel_state: self.cancel_state,
                });
                HandleEventResponse::None
            }
            InternalEvent::Executor(ExecutorEvent::InfraFailed { test_unit, error }) => {
                self.running -= 1;
                assert!(
                    self.finished.insert(test_unit.index),
                    "unit {} (index {}) finished twice",
                    test_unit.id,
                    test_unit.index,
                );
                self.run_stats.exec_failed += 1;
                self.infra_errors.push(error.clone());
                self.basic_callback(TestEventKind::TestInfraFailed { test_unit, error });
                // Infrastructure faults stop new dispatch but let running
                // units finish, so no kill is broadcast.
                self.begin_cancel(CancelReason::InfraFailure)
            }
            InternalEvent::Signal(SignalEvent::Shutdown(event)) => self.handle_shutdown(event),
        }
    }

    fn handle_shutdown(&mut self, event: ShutdownEvent) -> HandleEventResponse {
        let reason = match event {
            #[cfg(unix)]
            ShutdownEvent::Hangup | ShutdownEvent::Term => CancelReason::Signal,
            ShutdownEvent::Interrupt => CancelReason::Interrupt,
        };

        if reason == CancelReason::Interrupt && !self.sequential_mode {
            // Interrupting a concurrent run cannot be done safely without
            // risking orphaned processes; the standard handler is not even
            // installed in that mode. Belt and braces.
            warn!("ignoring interrupt during a concurrent run");
            return HandleEventResponse::None;
        }

        let signal_count = self.increment_signal_count();
        if signal_count == SignalCount::Twice {
            // A second signal always takes the run down.
            return self.begin_cancel(reason);
        }

        if reason == CancelReason::Interrupt && self.keep_going {
            // Kill the running unit's subprocess but keep the sequential
            // run going.
            return HandleEventResponse::KillRunning;
        }

        self.begin_cancel(reason)
    }

    /// Begin cancellation of a test run. Report it if the current cancel
    /// state is less than the required one.
    fn begin_cancel(&mut self, reason: CancelReason) -> HandleEventResponse {
        if self.cancel_state < Some(reason) {
            self.cancel_state = Some(reason);
            self.basic_callback(TestEventKind::RunBeginCancel {
                running: self.running,
                reason,
            });
            HandleEventResponse::Cancel(reason)
        } else {
            HandleEventResponse::None
        }
    }

    fn increment_signal_count(&mut self) -> SignalCount {
        let new_count = match self.signal_count {
            None => SignalCount::Once,
            Some(SignalCount::Once | SignalCount::Twice) => SignalCount::Twice,
        };
        self.signal_count = Some(new_count);
        new_count
    }
}

#[derive(Debug)]
enum InternalEvent<'a> {
    Executor(ExecutorEvent<'a>),
    Signal(SignalEvent),
}

/// The return result of `handle_event`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use = "this enum should not be dropped on the floor"]
enum HandleEventResponse {
    /// Kill running subprocesses without cancelling the run.
    KillRunning,

    /// Cancel the run.
    Cancel(CancelReason),

    /// No response.
    None,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum SignalCount {
    Once,
    Twice,
}
