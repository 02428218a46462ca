// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The executor runs individual test units in their own subprocess.
//!
//! Each unit task launches the configured program through the
//! [`ProcessLauncher`], streams its merged output into an
//! [`OutputClassifier`] line by line, enforces the timeout watchdog, and
//! derives the terminal status from the exit code and the classifier's
//! flags. Workers only touch their own state and report through events;
//! suite-level aggregation belongs to the dispatcher.

use super::internal_events::{AttemptSpec, ExecutorEvent, InternalExecuteStatus, KillRequest};
use crate::{
    classify::OutputClassifier,
    config::{KNOWN_RACE_EXIT_CODE, SuiteConfig},
    errors::InfraError,
    list::TestUnit,
    process::{CommandSpec, ProcessHandle, ProcessLauncher},
    reporter::events::ExecutionResult,
    stopwatch::StopwatchStart,
    workdir::{self, CleanupList, ScratchDirs},
};
use camino::Utf8Path;
use std::{
    io,
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::{broadcast, mpsc::UnboundedSender};
use tracing::debug;

pub(super) struct ExecutorContext<'cx, L> {
    config: &'cx SuiteConfig,
    launcher: &'cx L,
    cleanup: &'cx CleanupList,
}

impl<'cx, L> Clone for ExecutorContext<'cx, L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'cx, L> Copy for ExecutorContext<'cx, L> {}

impl<'cx, L: ProcessLauncher> ExecutorContext<'cx, L> {
    pub(super) fn new(config: &'cx SuiteConfig, launcher: &'cx L, cleanup: &'cx CleanupList) -> Self {
        Self {
            config,
            launcher,
            cleanup,
        }
    }

    /// Runs one attempt of one unit, reporting through `resp_tx`.
    ///
    /// Returns the unit if this attempt failed and should be queued for the
    /// sequential retry.
    pub(super) async fn run_unit_task<'list>(
        &self,
        test_unit: &'list TestUnit,
        spec: AttemptSpec,
        resp_tx: &UnboundedSender<ExecutorEvent<'list>>,
        kill_sender: &broadcast::Sender<KillRequest>,
        cancelled: &AtomicBool,
    ) -> Option<&'list TestUnit> {
        // Subscribe before checking the cancellation flag. The ordering is
        // important to avoid a race with a kill that is broadcast right
        // after the flag is set.
        let kill_rx = kill_sender.subscribe();

        if cancelled.load(Ordering::Acquire) {
            return None;
        }

        if let Some(reason) = &test_unit.disabled {
            let reason = if reason.is_empty() {
                "disabled in manifest".to_owned()
            } else {
                reason.clone()
            };
            let _ = resp_tx.send(ExecutorEvent::Skipped { test_unit, reason });
            return None;
        }

        if spec.attempt > 1 {
            let _ = resp_tx.send(ExecutorEvent::RetryStarted { test_unit });
        }
        let _ = resp_tx.send(ExecutorEvent::Started {
            test_unit,
            attempt: spec.attempt,
        });

        match self.run_unit(test_unit, resp_tx, kill_rx).await {
            Err(error) => {
                // Stop new dispatch immediately: the flag must be set before
                // the event is handled, or the next queued unit could start
                // in the window before the dispatcher reacts.
                cancelled.store(true, Ordering::Release);
                let _ = resp_tx.send(ExecutorEvent::InfraFailed { test_unit, error });
                None
            }
            Ok(status) => {
                let will_retry = spec.retry_allowed
                    && self.config.retry_enabled()
                    && status.result.retry_eligible()
                    && !cancelled.load(Ordering::Acquire);
                let run_status = status.into_external(spec.attempt, test_unit.expected);
                if will_retry {
                    debug!(unit = %test_unit.id, "failed or timed out, will retry");
                    let _ = resp_tx.send(ExecutorEvent::AttemptFailedWillRetry {
                        test_unit,
                        run_status,
                    });
                    Some(test_unit)
                } else {
                    let _ = resp_tx.send(ExecutorEvent::Finished {
                        test_unit,
                        run_status,
                    });
                    None
                }
            }
        }
    }

    /// Launches and supervises the unit's subprocess. Scratch directories
    /// are removed on every path out, including timeouts and retries.
    async fn run_unit<'list>(
        &self,
        test_unit: &'list TestUnit,
        resp_tx: &UnboundedSender<ExecutorEvent<'list>>,
        kill_rx: broadcast::Receiver<KillRequest>,
    ) -> Result<InternalExecuteStatus, InfraError> {
        let scratch = workdir::create_scratch_dirs(self.config.work_root()).map_err(|error| {
            InfraError::Scratch {
                unit_id: test_unit.id.clone(),
                error: Arc::new(error),
            }
        })?;

        let result = self
            .run_unit_inner(test_unit, &scratch, resp_tx, kill_rx)
            .await;
        workdir::cleanup_dir(&scratch.base, self.cleanup).await;
        result
    }

    async fn run_unit_inner<'list>(
        &self,
        test_unit: &'list TestUnit,
        scratch: &ScratchDirs,
        resp_tx: &UnboundedSender<ExecutorEvent<'list>>,
        mut kill_rx: broadcast::Receiver<KillRequest>,
    ) -> Result<InternalExecuteStatus, InfraError> {
        let stopwatch = StopwatchStart::now();
        let scratch_err = |error: io::Error| InfraError::Scratch {
            unit_id: test_unit.id.clone(),
            error: Arc::new(error),
        };

        let prefs_file = if test_unit.prefs.is_empty() {
            None
        } else {
            let path = scratch.profile_dir.join("prefs.json");
            let contents = serde_json::to_vec(&test_unit.prefs)
                .map_err(|error| scratch_err(io::Error::from(error)))?;
            std::fs::write(&path, contents).map_err(scratch_err)?;
            Some(path)
        };

        let timeout = self.config.timeout_for(test_unit);
        let watchdog = self.config.watchdog_enabled();
        let spec = self.command_spec(
            test_unit,
            scratch,
            prefs_file.as_deref(),
            watchdog.then_some(timeout),
        );

        let mut handle = self
            .launcher
            .launch(&spec)
            .await
            .map_err(|error| InfraError::Spawn {
                unit_id: test_unit.id.clone(),
                error: Arc::new(error),
            })?;
        let pid = handle.pid();
        debug!(unit = %test_unit.id, ?pid, "launched test process");

        let mut classifier = OutputClassifier::new();
        let mut timed_out = false;
        let mut kills_done = false;
        let mut read_error: Option<io::Error> = None;
        // One watchdog for the unit's whole lifetime, streaming and reaping
        // included.
        let mut timeout_sleep = pin!(tokio::time::sleep(timeout));

        loop {
            let mut kill_now = false;
            tokio::select! {
                line = handle.next_line() => match line {
                    Ok(Some(line)) => {
                        classifier.process_line(&line);
                        if self.config.verbose() {
                            let _ = resp_tx.send(ExecutorEvent::Output { test_unit, line });
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        read_error = Some(error);
                        break;
                    }
                },
                _ = timeout_sleep.as_mut(), if watchdog && !timed_out => {
                    timed_out = true;
                    kill_now = true;
                }
                recv = kill_rx.recv(), if !kills_done => match recv {
                    Ok(KillRequest::Kill) => kill_now = true,
                    Err(_) => kills_done = true,
                },
            }
            if kill_now {
                debug!(unit = %test_unit.id, ?pid, timed_out, "killing test process");
                let _ = handle.kill().await;
            }
        }
        classifier.finish();

        if let Some(error) = read_error {
            let _ = handle.kill().await;
            return Err(InfraError::Read {
                unit_id: test_unit.id.clone(),
                error: Arc::new(error),
            });
        }

        let exit_status = loop {
            let mut kill_now = false;
            tokio::select! {
                res = handle.wait() => break res,
                _ = timeout_sleep.as_mut(), if watchdog && !timed_out => {
                    timed_out = true;
                    kill_now = true;
                }
                recv = kill_rx.recv(), if !kills_done => match recv {
                    Ok(KillRequest::Kill) => kill_now = true,
                    Err(_) => kills_done = true,
                },
            }
            if kill_now {
                debug!(unit = %test_unit.id, ?pid, timed_out, "killing test process");
                let _ = handle.kill().await;
            }
        };
        let exit_status = exit_status.map_err(|error| InfraError::Wait {
            unit_id: test_unit.id.clone(),
            error: Arc::new(error),
        })?;

        // Local handles are fully reaped by the wait above; alternate
        // implementations may report an exit status while the process is
        // somehow still alive.
        let lingering = matches!(handle.try_wait(), Ok(None));
        if lingering {
            debug!(unit = %test_unit.id, ?pid, "process still running after test, killing");
            let _ = handle.kill().await;
        }

        let exit_code = exit_status.code();
        let return_code_ok = exit_code == Some(0)
            || (self.config.race_detector() && exit_code == Some(KNOWN_RACE_EXIT_CODE));

        // A clean return code without the crash-reporter marker means the
        // process crashed before the reporter was set up.
        let ended_before_crash_reporter_init = return_code_ok
            && self.config.crash_reporter()
            && !classifier.saw_crash_reporter_init()
            && classifier.saw_output();

        let passed = return_code_ok
            && !classifier.has_failure_output()
            && !ended_before_crash_reporter_init
            && !lingering;

        let (result, message) = if timed_out {
            // A timeout may be downgraded to FAIL, never to PASS.
            let result = if self.config.timeout_as_pass() {
                ExecutionResult::Fail
            } else {
                ExecutionResult::Timeout
            };
            (result, "test timed out".to_owned())
        } else if lingering {
            (
                ExecutionResult::Fail,
                "process still running after test".to_owned(),
            )
        } else if ended_before_crash_reporter_init {
            (
                ExecutionResult::Crash,
                "test ended before setting up the crash reporter".to_owned(),
            )
        } else {
            let message = match exit_code {
                Some(code) => format!("exit code: {code}"),
                None => "terminated by signal".to_owned(),
            };
            let result = if passed {
                ExecutionResult::Pass
            } else {
                ExecutionResult::Fail
            };
            (result, message)
        };

        Ok(InternalExecuteStatus {
            result,
            output: classifier.into_output(),
            pid,
            exit_code,
            stopwatch_end: stopwatch.end(),
            message,
        })
    }

    fn command_spec(
        &self,
        test_unit: &TestUnit,
        scratch: &ScratchDirs,
        prefs_file: Option<&Utf8Path>,
        timeout: Option<Duration>,
    ) -> CommandSpec {
        let mut args = self.config.base_args().to_vec();
        args.push(test_unit.path.as_str().to_owned());

        let mut env: Vec<(String, String)> = self.config.extra_env().to_vec();
        env.extend(
            test_unit
                .env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        env.push((
            "SHELLTEST_TEMP_DIR".to_owned(),
            scratch.temp_dir.to_string(),
        ));
        env.push((
            "SHELLTEST_PROFILE_DIR".to_owned(),
            scratch.profile_dir.to_string(),
        ));
        if let Some(prefs_file) = prefs_file {
            env.push(("SHELLTEST_PREFS_FILE".to_owned(), prefs_file.to_string()));
        }
        if let Some(timeout) = timeout {
            env.push((
                "SHELLTEST_TIMEOUT_SECS".to_owned(),
                timeout.as_secs().to_string(),
            ));
        }
        if test_unit.dmd {
            env.push(("SHELLTEST_DMD".to_owned(), "1".to_owned()));
        }

        // A bare filename has an empty parent; run it from the ambient cwd.
        let cwd = test_unit
            .path
            .parent()
            .filter(|dir| !dir.as_str().is_empty())
            .map(Utf8Path::to_path_buf);

        CommandSpec {
            program: self.config.program().to_owned(),
            args,
            cwd,
            env,
        }
    }
}
