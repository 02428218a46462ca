// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prints out test execution statuses.
//!
//! The main structure in this module is [`TestReporter`].

pub mod events;
pub mod structured;

use self::events::{CancelReason, ExecuteStatus, ExecutionResult, RunPhase, TestEvent, TestEventKind};
use crate::list::{ExpectedOutcome, TestUnit};
use owo_colors::{OwoColorize, Style};
use std::io::{self, Write};

/// Builder for [`TestReporter`].
#[derive(Debug, Default)]
pub struct TestReporterBuilder {
    verbose: bool,
    verbose_if_fails: bool,
}

impl TestReporterBuilder {
    /// Prints start events and forwarded output lines.
    pub fn set_verbose(&mut self, verbose: bool) -> &mut Self {
        self.verbose = verbose;
        self
    }

    /// Replays buffered output for attempts that will be retried.
    pub fn set_verbose_if_fails(&mut self, verbose_if_fails: bool) -> &mut Self {
        self.verbose_if_fails = verbose_if_fails;
        self
    }

    /// Creates the reporter.
    pub fn build(&self) -> TestReporter {
        TestReporter {
            verbose: self.verbose,
            verbose_if_fails: self.verbose_if_fails,
            styles: Box::default(),
            cancel_status: None,
        }
    }
}

/// Functionality to report test results to a writer, usually stderr.
#[derive(Debug)]
pub struct TestReporter {
    verbose: bool,
    verbose_if_fails: bool,
    styles: Box<Styles>,
    cancel_status: Option<CancelReason>,
}

impl TestReporter {
    /// Colorizes output.
    pub fn colorize(&mut self) {
        self.styles.colorize();
    }

    /// Report a test event.
    pub fn report_event(
        &mut self,
        event: &TestEvent<'_>,
        mut writer: impl Write,
    ) -> io::Result<()> {
        match &event.kind {
            TestEventKind::RunStarted { test_list, .. } => {
                write!(writer, "{:>12} ", "Starting".style(self.styles.pass))?;
                writeln!(
                    writer,
                    "{} tests",
                    test_list.len().style(self.styles.count)
                )?;
            }
            TestEventKind::PhaseStarted {
                phase,
                queued,
                test_threads,
            } => match phase {
                RunPhase::Concurrent => {
                    writeln!(
                        writer,
                        "{:>12} {} tests using at most {} threads",
                        "Running".style(self.styles.pass),
                        queued.style(self.styles.count),
                        test_threads.style(self.styles.count),
                    )?;
                }
                RunPhase::Sequential => {
                    writeln!(
                        writer,
                        "{:>12} {} tests sequentially",
                        "Running".style(self.styles.pass),
                        queued.style(self.styles.count),
                    )?;
                }
                RunPhase::Retry => {
                    writeln!(
                        writer,
                        "{:>12} {} tests that failed when run in parallel",
                        "Retrying".style(self.styles.retry),
                        queued.style(self.styles.count),
                    )?;
                }
            },
            TestEventKind::TestStarted { test_unit, .. } => {
                if self.verbose {
                    write!(writer, "{:>12} [         ] ", "START".style(self.styles.pass))?;
                    writeln!(writer, "{}", test_unit.id)?;
                }
            }
            TestEventKind::TestOutput { line, .. } => {
                if self.verbose {
                    writeln!(writer, "{line}")?;
                }
            }
            TestEventKind::TestSkipped { test_unit, reason } => {
                write!(writer, "{:>12} [         ] ", "SKIP".style(self.styles.skip))?;
                writeln!(writer, "{} ({reason})", test_unit.id)?;
            }
            TestEventKind::TestAttemptFailedWillRetry {
                test_unit,
                run_status,
            } => {
                write!(writer, "{:>12} ", "RETRY".style(self.styles.retry))?;
                self.write_duration(run_status.time_taken, &mut writer)?;
                writeln!(writer, "{} ({})", test_unit.id, run_status.message)?;
                if self.verbose_if_fails && !self.verbose {
                    self.write_output(test_unit, run_status, &mut writer)?;
                }
            }
            TestEventKind::TestRetryStarted { test_unit } => {
                write!(writer, "{:>12} [         ] ", "TRY 2".style(self.styles.retry))?;
                writeln!(writer, "{}", test_unit.id)?;
            }
            TestEventKind::TestFinished {
                test_unit,
                run_status,
                ..
            } => {
                let (label, style) = self.status_label(run_status);
                write!(writer, "{:>12} ", label.style(style))?;
                self.write_duration(run_status.time_taken, &mut writer)?;
                writeln!(writer, "{} ({})", test_unit.id, run_status.message)?;

                // Full diagnostic output for unexpected outcomes. In
                // verbose mode every line was already forwarded live.
                // Don't print output after a signal cancelled the run.
                let show_output = run_status.is_unexpected() && !self.verbose;
                if show_output && self.cancel_status < Some(CancelReason::Signal) {
                    self.write_output(test_unit, run_status, &mut writer)?;
                }
            }
            TestEventKind::TestInfraFailed { test_unit, error } => {
                write!(writer, "{:>12} [         ] ", "INFRA".style(self.styles.fail))?;
                writeln!(writer, "{}", test_unit.id)?;
                write!(writer, "{error}")?;
                let mut source = std::error::Error::source(error);
                while let Some(error) = source {
                    write!(writer, ": {error}")?;
                    source = error.source();
                }
                writeln!(writer)?;
            }
            TestEventKind::RunBeginCancel { running, reason } => {
                self.cancel_status = self.cancel_status.max(Some(*reason));
                write!(writer, "{:>12} ", "Canceling".style(self.styles.fail))?;
                writeln!(
                    writer,
                    "due to {}: {} tests still running",
                    reason.to_static_str().style(self.styles.fail),
                    running.style(self.styles.count),
                )?;
            }
            TestEventKind::RunFinished {
                elapsed, run_stats, ..
            } => {
                let summary_style = if run_stats.any_failed() {
                    self.styles.fail
                } else {
                    self.styles.pass
                };
                write!(writer, "{:>12} ", "Summary".style(summary_style))?;
                write!(writer, "[{:>8.3}s] ", elapsed.as_secs_f64())?;
                write!(
                    writer,
                    "{} tests run: {} passed, {} failed",
                    run_stats.finished_count.style(self.styles.count),
                    run_stats.passed.style(self.styles.pass),
                    run_stats.failed.style(if run_stats.failed > 0 {
                        self.styles.fail
                    } else {
                        self.styles.count
                    }),
                )?;
                if run_stats.todo > 0 {
                    write!(
                        writer,
                        ", {} {}",
                        run_stats.todo.style(self.styles.count),
                        "todo".style(self.styles.skip),
                    )?;
                }
                if run_stats.timed_out > 0 {
                    write!(
                        writer,
                        ", {} {}",
                        run_stats.timed_out.style(self.styles.count),
                        "timed out".style(self.styles.fail),
                    )?;
                }
                if run_stats.crashed > 0 {
                    write!(
                        writer,
                        ", {} {}",
                        run_stats.crashed.style(self.styles.count),
                        "crashed".style(self.styles.fail),
                    )?;
                }
                if run_stats.exec_failed > 0 {
                    write!(
                        writer,
                        ", {} {}",
                        run_stats.exec_failed.style(self.styles.count),
                        "exec failed".style(self.styles.fail),
                    )?;
                }
                if run_stats.retried > 0 {
                    write!(
                        writer,
                        ", {} {}",
                        run_stats.retried.style(self.styles.count),
                        "retried".style(self.styles.retry),
                    )?;
                }
                write!(
                    writer,
                    ", {} {}",
                    run_stats.skipped.style(self.styles.count),
                    "skipped".style(self.styles.skip),
                )?;
                writeln!(writer)?;
            }
        }
        Ok(())
    }

    fn write_duration(&self, duration: std::time::Duration, mut writer: impl Write) -> io::Result<()> {
        // * > means right-align.
        // * 8 is the number of characters to pad to.
        // * .3 means print three digits after the decimal point.
        write!(writer, "[{:>8.3}s] ", duration.as_secs_f64())
    }

    /// Replays a unit's buffered output, wrapped in banner markers, in
    /// original order.
    fn write_output(
        &self,
        test_unit: &TestUnit,
        run_status: &ExecuteStatus,
        mut writer: impl Write,
    ) -> io::Result<()> {
        if run_status.output.is_empty() {
            return Ok(());
        }
        writeln!(
            writer,
            "{} {}",
            ">>>>>>>".style(self.styles.fail),
            test_unit.id,
        )?;
        for line in &run_status.output.lines {
            writeln!(writer, "{line}")?;
        }
        writeln!(writer, "{}", "<<<<<<<".style(self.styles.fail))?;
        Ok(())
    }

    fn status_label(&self, run_status: &ExecuteStatus) -> (&'static str, Style) {
        match (run_status.result, run_status.expected) {
            (ExecutionResult::Pass, ExpectedOutcome::Pass) => ("PASS", self.styles.pass),
            (ExecutionResult::Pass, ExpectedOutcome::Fail) => ("UPASS", self.styles.fail),
            (ExecutionResult::Fail, ExpectedOutcome::Fail) => ("TODO", self.styles.skip),
            (ExecutionResult::Fail, ExpectedOutcome::Pass) => ("FAIL", self.styles.fail),
            (ExecutionResult::Timeout, _) => ("TIMEOUT", self.styles.fail),
            (ExecutionResult::Crash, _) => ("CRASH", self.styles.fail),
            (ExecutionResult::ExecFail, _) => ("ERROR", self.styles.fail),
        }
    }
}


#[derive(Debug, Default)]
struct Styles {
    pass: Style,
    fail: Style,
    retry: Style,
    skip: Style,
    count: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.retry = Style::new().magenta().bold();
        self.skip = Style::new().yellow();
        self.count = Style::new().bold();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        classify::UnitOutput,
        list::{ListSettings, Manifest, TestDef, TestList},
        reporter::events::RunStats,
    };
    use chrono::Local;
    use std::time::Duration;

    fn render(reporter: &mut TestReporter, kind: TestEventKind<'_>) -> String {
        let event = TestEvent {
            timestamp: Local::now().fixed_offset(),
            elapsed: Duration::from_secs(1),
            kind,
        };
        let mut buf = Vec::new();
        reporter.report_event(&event, &mut buf).expect("write ok");
        String::from_utf8(buf).expect("utf-8 output")
    }

    #[test]
    fn summary_line_carries_counts() {
        let mut reporter = TestReporterBuilder::default().build();
        let out = render(
            &mut reporter,
            TestEventKind::RunFinished {
                run_id: uuid::Uuid::new_v4(),
                start_time: Local::now().fixed_offset(),
                elapsed: Duration::from_secs(2),
                run_stats: RunStats {
                    initial_run_count: 5,
                    finished_count: 4,
                    passed: 2,
                    failed: 1,
                    todo: 1,
                    retried: 1,
                    skipped: 1,
                    ..RunStats::default()
                },
            },
        );
        assert!(out.contains("4 tests run"), "output: {out}");
        assert!(out.contains("2 passed"), "output: {out}");
        assert!(out.contains("1 failed"), "output: {out}");
        assert!(out.contains("1 todo"), "output: {out}");
        assert!(out.contains("1 retried"), "output: {out}");
        assert!(out.contains("1 skipped"), "output: {out}");
    }

    #[test]
    fn failing_test_output_is_wrapped_in_banners() {
        let mut manifest = Manifest::default();
        manifest.tests.push(TestDef::new("a.sh"));
        let list = TestList::new(manifest, &ListSettings::default());
        let test_unit = &list.units()[0];

        let run_status = ExecuteStatus {
            attempt: 1,
            result: ExecutionResult::Fail,
            expected: crate::list::ExpectedOutcome::Pass,
            pid: Some(123),
            exit_code: Some(1),
            output: UnitOutput {
                lines: vec!["line one".to_owned(), "line two".to_owned()],
            },
            start_time: Local::now(),
            time_taken: Duration::from_millis(10),
            message: "exit code: 1".to_owned(),
        };

        let mut reporter = TestReporterBuilder::default().build();
        let out = render(
            &mut reporter,
            TestEventKind::TestFinished {
                test_unit,
                run_status,
                current_stats: RunStats::default(),
                running: 0,
                cancel_state: None,
            },
        );
        assert!(out.contains("FAIL"), "output: {out}");
        let start = out.find(">>>>>>>").expect("banner start");
        let end = out.find("<<<<<<<").expect("banner end");
        assert!(start < end);
        let body = &out[start..end];
        assert!(body.contains("line one") && body.contains("line two"));
    }
}
