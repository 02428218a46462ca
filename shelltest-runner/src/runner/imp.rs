// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    dispatcher::DispatcherContext,
    executor::ExecutorContext,
    internal_events::{AttemptSpec, ExecutorEvent, KillRequest},
};
use crate::{
    config::SuiteConfig,
    errors::{InfraErrors, TestRunnerBuildError},
    list::{TestList, TestUnit},
    process::ProcessLauncher,
    reporter::events::{RunPhase, RunStats, TestEvent},
    signal::{SignalHandler, SignalHandlerKind},
    workdir::CleanupList,
};
use async_scoped::TokioScope;
use futures::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::{
    runtime::Runtime,
    sync::{broadcast, mpsc::unbounded_channel},
};
use tracing::debug;
use uuid::Uuid;

/// Test runner options.
#[derive(Debug, Default)]
pub struct TestRunnerBuilder {
    signal_handler: Option<SignalHandlerKind>,
}

impl TestRunnerBuilder {
    /// Overrides the signal handler kind. The standard handler is only ever
    /// installed for fully sequential runs; concurrent runs always get the
    /// no-op handler because partial concurrent teardown cannot be done
    /// safely.
    pub fn set_signal_handler_kind(&mut self, kind: SignalHandlerKind) -> &mut Self {
        self.signal_handler = Some(kind);
        self
    }

    /// Creates a new test runner.
    pub fn build<'a, L: ProcessLauncher>(
        self,
        test_list: &'a TestList,
        config: &'a SuiteConfig,
        launcher: L,
    ) -> Result<TestRunner<'a, L>, TestRunnerBuildError> {
        let test_threads = if config.sequential() {
            1
        } else {
            config.test_threads().compute(config.instrumented())
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("shelltest-runner-worker")
            .build()
            .map_err(TestRunnerBuildError::TokioRuntimeCreate)?;
        let _guard = runtime.enter();

        let requested = self.signal_handler.unwrap_or(SignalHandlerKind::Standard);
        let handler_kind = if config.sequential() {
            requested
        } else {
            SignalHandlerKind::Noop
        };
        // build() must be called from within the runtime guard.
        let signal_handler = handler_kind
            .build()
            .map_err(TestRunnerBuildError::SignalHandlerSetup)?;

        Ok(TestRunner {
            inner: TestRunnerInner {
                config,
                test_list,
                test_threads,
                launcher,
                runtime,
                run_id: Uuid::new_v4(),
            },
            signal_handler,
        })
    }
}

/// Context for running tests.
///
/// Created using [`TestRunnerBuilder::build`].
#[derive(Debug)]
pub struct TestRunner<'a, L> {
    inner: TestRunnerInner<'a, L>,
    signal_handler: SignalHandler,
}

impl<'a, L: ProcessLauncher> TestRunner<'a, L> {
    /// Executes the listed tests, each one in its own process.
    ///
    /// The callback is called with the results of each test. Returns the
    /// aggregate statistics, or the collected infrastructure errors if any
    /// occurred (after in-flight units have finished).
    pub fn execute<F>(mut self, callback: F) -> Result<RunStats, InfraErrors>
    where
        F: FnMut(TestEvent<'a>) + Send,
    {
        self.inner.execute(&mut self.signal_handler, callback)
    }
}

#[derive(Debug)]
struct TestRunnerInner<'a, L> {
    config: &'a SuiteConfig,
    test_list: &'a TestList,
    test_threads: usize,
    launcher: L,
    runtime: Runtime,
    run_id: Uuid,
}

impl<'a, L: ProcessLauncher> TestRunnerInner<'a, L> {
    fn execute<F>(
        &self,
        signal_handler: &mut SignalHandler,
        callback: F,
    ) -> Result<RunStats, InfraErrors>
    where
        F: FnMut(TestEvent<'a>) + Send,
    {
        let cancelled = AtomicBool::new(false);
        let cancelled_ref = &cancelled;

        let mut dispatcher_cx = DispatcherContext::new(
            callback,
            self.run_id,
            self.test_list.len(),
            self.config.sequential(),
            self.config.keep_going(),
        );

        // Send the initial event. (No need to consult the cancelled flag:
        // the run hasn't started yet.)
        dispatcher_cx.run_started(self.test_list);

        let cleanup = CleanupList::default();
        let executor_cx = ExecutorContext::new(self.config, &self.launcher, &cleanup);
        let (parallel, sequential) = self.test_list.partition(self.config.sequential());
        let test_threads = self.test_threads;

        let dispatcher_cx_mut = &mut dispatcher_cx;

        let _guard = self.runtime.enter();

        // 4 is greater than the number of kill messages that will ever be
        // sent over this channel. Hold a receiver open so there are no
        // spurious SendErrors on the sender.
        let (kill_sender, _kill_receiver) = broadcast::channel::<KillRequest>(4);
        let kill_sender_ref = &kill_sender;

        TokioScope::scope_and_block(move |scope| {
            let (resp_tx, resp_rx) = unbounded_channel::<ExecutorEvent<'a>>();

            // Run the dispatcher to completion in a task. It exits once
            // every sender is dropped at the end of the phases below.
            let dispatcher_fut = dispatcher_cx_mut.run(
                resp_rx,
                signal_handler,
                cancelled_ref,
                kill_sender_ref.clone(),
            );
            scope.spawn_cancellable(dispatcher_fut, || ());

            let run_fut = async move {
                let mut retry_list: Vec<&TestUnit> = Vec::new();

                // Concurrent phase: spawned in queue order, completed in
                // any order, bounded by test_threads.
                if !parallel.is_empty() {
                    let _ = resp_tx.send(ExecutorEvent::PhaseStarted {
                        phase: RunPhase::Concurrent,
                        queued: parallel.len(),
                        test_threads,
                    });
                    let mut source = parallel.into_iter();
                    let mut in_flight = futures::stream::FuturesUnordered::new();
                    for test_unit in source.by_ref().take(test_threads) {
                        in_flight.push(run_parallel_unit(
                            &executor_cx,
                            test_unit,
                            resp_tx.clone(),
                            kill_sender_ref,
                            cancelled_ref,
                        ));
                    }
                    while let Some(candidate) = in_flight.next().await {
                        retry_list.extend(candidate);
                        if let Some(test_unit) = source.next() {
                            in_flight.push(run_parallel_unit(
                                &executor_cx,
                                test_unit,
                                resp_tx.clone(),
                                kill_sender_ref,
                                cancelled_ref,
                            ));
                        }
                    }
                }

                // Sequential phase: strictly one at a time, in queue order,
                // with the cancellation flag polled between units.
                if !sequential.is_empty() && !cancelled_ref.load(Ordering::Acquire) {
                    let _ = resp_tx.send(ExecutorEvent::PhaseStarted {
                        phase: RunPhase::Sequential,
                        queued: sequential.len(),
                        test_threads: 1,
                    });
                    for test_unit in sequential {
                        if cancelled_ref.load(Ordering::Acquire) {
                            break;
                        }
                        if let Some(test_unit) = executor_cx
                            .run_unit_task(
                                test_unit,
                                AttemptSpec::first(),
                                &resp_tx,
                                kill_sender_ref,
                                cancelled_ref,
                            )
                            .await
                        {
                            retry_list.push(test_unit);
                        }
                    }
                }

                // Retry phase: drained entirely, one at a time, in queue
                // order. A unit that fails here is terminal.
                retry_list.sort_by_key(|test_unit| test_unit.index);
                if !retry_list.is_empty() && !cancelled_ref.load(Ordering::Acquire) {
                    let _ = resp_tx.send(ExecutorEvent::PhaseStarted {
                        phase: RunPhase::Retry,
                        queued: retry_list.len(),
                        test_threads: 1,
                    });
                    for test_unit in retry_list {
                        if cancelled_ref.load(Ordering::Acquire) {
                            break;
                        }
                        executor_cx
                            .run_unit_task(
                                test_unit,
                                AttemptSpec::retry(),
                                &resp_tx,
                                kill_sender_ref,
                                cancelled_ref,
                            )
                            .await;
                    }
                }

                // resp_tx drops here, closing the dispatcher's channel.
            };
            scope.spawn_cancellable(run_fut, || ());
        });

        // Clean up any slacker directories that might be lying around.
        cleanup.drain_best_effort();

        if !dispatcher_cx.retried_units().is_empty() {
            debug!(retried = ?dispatcher_cx.retried_units(), "units were retried");
        }

        dispatcher_cx.run_finished();
        let run_stats = dispatcher_cx.run_stats();
        let infra_errors = dispatcher_cx.take_infra_errors();
        if infra_errors.is_empty() {
            Ok(run_stats)
        } else {
            Err(InfraErrors::new(infra_errors))
        }
    }
}

async fn run_parallel_unit<'list, L: ProcessLauncher>(
    executor_cx: &ExecutorContext<'_, L>,
    test_unit: &'list TestUnit,
    resp_tx: tokio::sync::mpsc::UnboundedSender<ExecutorEvent<'list>>,
    kill_sender: &broadcast::Sender<KillRequest>,
    cancelled: &AtomicBool,
) -> Option<&'list TestUnit> {
    executor_cx
        .run_unit_task(test_unit, AttemptSpec::first(), &resp_tx, kill_sender, cancelled)
        .await
}
