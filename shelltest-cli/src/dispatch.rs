// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{WrapErr, eyre},
};
use shelltest_runner::{
    config::{RetryPolicy, SuiteConfigBuilder, TestThreads},
    list::{ListSettings, Manifest, TestList},
    process::LocalLauncher,
    reporter::{TestReporterBuilder, structured::StructuredReporter},
    runner::TestRunnerBuilder,
};
use std::{fs::File, io::BufWriter, time::Duration};
use tracing::error;

/// Exit code on a clean run.
const EXIT_OK: i32 = 0;
/// Exit code for test failures and empty runs.
const EXIT_TEST_FAILURE: i32 = 1;
/// Exit code for an infrastructure abort, distinguishable by automation so
/// the job can be retried rather than reported as a test failure.
const EXIT_INFRA_ABORT: i32 = 4;

/// Runs shell-style test programs from a manifest, in parallel.
#[derive(Debug, Parser)]
#[command(name = "shelltest", version, about)]
pub struct ShelltestApp {
    /// Path to the test manifest (TOML).
    manifest: Utf8PathBuf,

    /// The program each test is run with.
    #[arg(long)]
    program: Utf8PathBuf,

    /// Extra argument passed to the program ahead of the test path. May be
    /// repeated.
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
    program_args: Vec<String>,

    /// Set an environment variable (KEY=VALUE) for every test. May be
    /// repeated.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Number of tests to run simultaneously ("detect" or a count).
    #[arg(long, short = 'j', value_name = "THREADS")]
    test_threads: Option<TestThreads>,

    /// Run every test sequentially.
    #[arg(long)]
    sequential: bool,

    /// Base per-test timeout, in seconds.
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Report timeouts as ordinary failures.
    #[arg(long)]
    timeout_as_pass: bool,

    /// The program is a race-detector build; accept its known-race exit
    /// code.
    #[arg(long)]
    race_detector: bool,

    /// The program is a memory-hungry instrumented build; halves the
    /// detected thread count.
    #[arg(long)]
    instrumented: bool,

    /// Require the crash-reporter-initialized marker in test output.
    #[arg(long)]
    crash_reporter: bool,

    /// Retry policy for failing tests (automatic, never, always).
    #[arg(long, value_name = "POLICY")]
    retries: Option<RetryPolicy>,

    /// Run only known failures; zero failures becomes the failure
    /// condition.
    #[arg(long)]
    run_failures: bool,

    /// Keep a sequential run going after an interrupt kills one test.
    #[arg(long)]
    keep_going: bool,

    /// Interactive run: disarms the per-test timeout watchdog.
    #[arg(long)]
    interactive: bool,

    /// The tests run under an attached debugger: disarms the watchdog.
    #[arg(long)]
    under_debugger: bool,

    /// Run each test this many extra times (forces sequential mode).
    #[arg(long, value_name = "COUNT", default_value_t = 0)]
    repeat: usize,

    /// Shuffle the test list.
    #[arg(long)]
    shuffle: bool,

    /// Only run tests whose path ends with this suffix (forces sequential
    /// mode).
    #[arg(long, value_name = "SUFFIX")]
    test_path: Option<String>,

    /// Forward test output live instead of buffering it.
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Replay buffered output for attempts that will be retried.
    #[arg(long)]
    verbose_if_fails: bool,

    /// Write machine-readable JSON records to this file.
    #[arg(long, value_name = "PATH")]
    structured_log: Option<Utf8PathBuf>,

    /// Create per-test scratch directories under this directory.
    #[arg(long, value_name = "DIR")]
    work_root: Option<Utf8PathBuf>,
}

impl ShelltestApp {
    /// Executes the run, returning the process exit code.
    pub fn exec(self) -> Result<i32> {
        tracing_subscriber::fmt()
            .with_max_level(if self.verbose {
                tracing::Level::DEBUG
            } else {
                tracing::Level::WARN
            })
            .with_writer(std::io::stderr)
            .init();

        let input = std::fs::read_to_string(&self.manifest)
            .wrap_err_with(|| format!("failed to read manifest `{}`", self.manifest))?;
        let manifest = Manifest::from_toml_str(&input)
            .wrap_err_with(|| format!("failed to parse manifest `{}`", self.manifest))?;

        let default_group = self
            .manifest
            .file_stem()
            .unwrap_or("shelltest")
            .to_owned();

        // Selecting a single file, a repeat count, or an attached debugger
        // implies a sequential run.
        let sequential =
            self.sequential || self.test_path.is_some() || self.repeat > 0 || self.under_debugger;

        let settings = ListSettings {
            repeat: self.repeat,
            shuffle: self.shuffle,
            shuffle_seed: None,
            filter: self.test_path.clone(),
            default_group: Some(default_group.clone()),
        };
        let test_list = TestList::new(manifest, &settings);

        let mut builder = SuiteConfigBuilder::new(self.program.clone());
        builder
            .set_base_args(self.program_args.clone())
            .set_sequential(sequential)
            .set_timeout_as_pass(self.timeout_as_pass)
            .set_race_detector(self.race_detector)
            .set_instrumented(self.instrumented)
            .set_crash_reporter(self.crash_reporter)
            .set_run_failures(self.run_failures)
            .set_keep_going(self.keep_going)
            .set_interactive(self.interactive)
            .set_under_debugger(self.under_debugger)
            .set_verbose(self.verbose)
            .set_verbose_if_fails(self.verbose_if_fails);
        if let Some(test_threads) = self.test_threads {
            builder.set_test_threads(test_threads);
        }
        if let Some(timeout) = self.timeout {
            builder.set_harness_timeout(Duration::from_secs(timeout));
        }
        if let Some(retries) = self.retries {
            builder.set_retries(retries);
        }
        if let Some(work_root) = &self.work_root {
            builder.set_work_root(work_root.clone());
        }
        for entry in &self.env {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| eyre!("--env takes KEY=VALUE, got `{entry}`"))?;
            builder.add_env(key, value);
        }
        let config = builder.build();

        let mut reporter_builder = TestReporterBuilder::default();
        reporter_builder
            .set_verbose(self.verbose)
            .set_verbose_if_fails(self.verbose_if_fails);
        let mut reporter = reporter_builder.build();
        if supports_color::on(supports_color::Stream::Stderr).is_some() {
            reporter.colorize();
        }

        let mut structured = match &self.structured_log {
            Some(path) => {
                let file = File::create(path)
                    .wrap_err_with(|| format!("failed to create structured log `{path}`"))?;
                Some(StructuredReporter::new(BufWriter::new(file), default_group))
            }
            None => None,
        };

        let runner = TestRunnerBuilder::default().build(&test_list, &config, LocalLauncher)?;

        let stderr = std::io::stderr();
        let result = runner.execute(|event| {
            if let Some(structured) = &mut structured {
                if let Err(write_error) = structured.write_event(&event) {
                    error!("failed to write structured log record: {write_error}");
                }
            }
            let mut lock = stderr.lock();
            if let Err(write_error) = reporter.report_event(&event, &mut lock) {
                error!("failed to report event: {write_error}");
            }
        });

        match result {
            Ok(run_stats) => {
                if run_stats.suite_failed(config.automation(), config.run_failures()) {
                    Ok(EXIT_TEST_FAILURE)
                } else {
                    Ok(EXIT_OK)
                }
            }
            Err(infra_errors) => {
                for infra_error in infra_errors.errors() {
                    let mut message = infra_error.to_string();
                    let mut source = std::error::Error::source(infra_error);
                    while let Some(err) = source {
                        message.push_str(": ");
                        message.push_str(&err.to_string());
                        source = err.source();
                    }
                    error!("{message}");
                }
                Ok(EXIT_INFRA_ABORT)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses() {
        ShelltestApp::command().debug_assert();
    }

    #[test]
    fn args_map_to_options() {
        let app = ShelltestApp::parse_from([
            "shelltest",
            "manifest.toml",
            "--program",
            "bin/runner",
            "--arg",
            "--headless",
            "-j",
            "8",
            "--timeout",
            "30",
            "--retries",
            "always",
            "--test-path",
            "test_io.sh",
        ]);
        assert_eq!(app.manifest, "manifest.toml");
        assert_eq!(app.program, "bin/runner");
        assert_eq!(app.program_args, ["--headless"]);
        assert_eq!(app.test_threads, Some(TestThreads::Count(8)));
        assert_eq!(app.timeout, Some(30));
        assert_eq!(app.retries, Some(RetryPolicy::Always));
        assert_eq!(app.test_path.as_deref(), Some("test_io.sh"));
    }
}
