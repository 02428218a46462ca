// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Suite-wide configuration.
//!
//! A [`SuiteConfig`] is built once per run (via [`SuiteConfigBuilder`]) and
//! passed by reference into the runner. It is immutable for the lifetime of
//! the run: per-unit variation comes from the manifest, not from mutating
//! the configuration.

use crate::{
    errors::{RetryPolicyParseError, TestThreadsParseError},
    list::TestUnit,
};
use camino::{Utf8Path, Utf8PathBuf};
use std::{fmt, str::FromStr, time::Duration};

/// The default per-unit timeout.
pub const DEFAULT_HARNESS_TIMEOUT: Duration = Duration::from_secs(300);

/// The exit code race-detector builds use to report a detected race.
///
/// There is no way to distinguish a process that would have exited cleanly
/// but saw a race from a race-free process that deliberately exits with this
/// code. The ambiguity is constrained to race-detector builds.
pub const KNOWN_RACE_EXIT_CODE: i32 = 66;

/// Type for the number of concurrently running units.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestThreads {
    /// Run tests with a specified number of threads.
    Count(usize),

    /// Detect a reasonable default from the logical CPU count.
    ///
    /// The default is 4x the logical CPU count, halved on Windows, and
    /// halved again (with a floor of 2) for memory-hungry instrumented
    /// builds.
    Detect,
}

impl TestThreads {
    /// Gets the actual number of test threads computed at runtime.
    pub fn compute(self, instrumented: bool) -> usize {
        match self {
            Self::Count(threads) => threads.max(1),
            Self::Detect => {
                let cpus = std::thread::available_parallelism()
                    .map(std::num::NonZeroUsize::get)
                    .unwrap_or(1);
                let mut threads = cpus * 4;
                if cfg!(windows) {
                    threads /= 2;
                }
                if instrumented {
                    threads = (threads / 2).max(2);
                }
                threads.max(1)
            }
        }
    }
}

impl Default for TestThreads {
    fn default() -> Self {
        Self::Detect
    }
}

impl FromStr for TestThreads {
    type Err = TestThreadsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "detect" {
            return Ok(Self::Detect);
        }
        match s.parse::<usize>() {
            Ok(0) | Err(_) => Err(TestThreadsParseError::new(s)),
            Ok(threads) => Ok(Self::Count(threads)),
        }
    }
}

impl fmt::Display for TestThreads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(threads) => write!(f, "{threads}"),
            Self::Detect => write!(f, "detect"),
        }
    }
}

/// Whether failing units are eligible for a single sequential retry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RetryPolicy {
    /// Retry in unattended (automation) environments only.
    ///
    /// This is the default: local failures stay immediately actionable
    /// instead of being silently retried.
    #[default]
    Automatic,

    /// Never retry.
    Never,

    /// Always retry, including for local runs.
    Always,
}

impl FromStr for RetryPolicy {
    type Err = RetryPolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(Self::Automatic),
            "never" => Ok(Self::Never),
            "always" => Ok(Self::Always),
            other => Err(RetryPolicyParseError::new(other)),
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Automatic => write!(f, "automatic"),
            Self::Never => write!(f, "never"),
            Self::Always => write!(f, "always"),
        }
    }
}

/// Immutable configuration for a suite run.
///
/// Created with [`SuiteConfigBuilder`].
#[derive(Clone, Debug)]
pub struct SuiteConfig {
    program: Utf8PathBuf,
    base_args: Vec<String>,
    extra_env: Vec<(String, String)>,
    test_threads: TestThreads,
    harness_timeout: Duration,
    timeout_as_pass: bool,
    race_detector: bool,
    instrumented: bool,
    crash_reporter: bool,
    automation: bool,
    retries: RetryPolicy,
    run_failures: bool,
    sequential: bool,
    keep_going: bool,
    verbose: bool,
    verbose_if_fails: bool,
    interactive: bool,
    under_debugger: bool,
    work_root: Option<Utf8PathBuf>,
}

impl SuiteConfig {
    /// The program every unit is run with.
    pub fn program(&self) -> &Utf8Path {
        &self.program
    }

    /// Arguments passed to the program ahead of the unit's path.
    pub fn base_args(&self) -> &[String] {
        &self.base_args
    }

    /// Extra environment variables applied to every unit.
    pub fn extra_env(&self) -> &[(String, String)] {
        &self.extra_env
    }

    /// The configured concurrency.
    pub fn test_threads(&self) -> TestThreads {
        self.test_threads
    }

    /// The base per-unit timeout.
    pub fn harness_timeout(&self) -> Duration {
        self.harness_timeout
    }

    /// The timeout for a particular unit, with its requested multiplier
    /// applied.
    pub fn timeout_for(&self, test_unit: &TestUnit) -> Duration {
        self.harness_timeout * test_unit.timeout_factor.max(1)
    }

    /// Whether a timeout is reported as an ordinary `FAIL` rather than
    /// `TIMEOUT`. A timeout is never converted to a pass.
    pub fn timeout_as_pass(&self) -> bool {
        self.timeout_as_pass
    }

    /// Whether the program is a race-detector build, making
    /// [`KNOWN_RACE_EXIT_CODE`] an acceptable exit code.
    pub fn race_detector(&self) -> bool {
        self.race_detector
    }

    /// Whether this is a memory-hungry instrumented build. Halves the
    /// detected thread count. Race-detector builds are always instrumented.
    pub fn instrumented(&self) -> bool {
        self.instrumented || self.race_detector
    }

    /// Whether crash-reporter integration is enabled, making the
    /// `crash_reporter_init` output marker mandatory for a pass.
    pub fn crash_reporter(&self) -> bool {
        self.crash_reporter
    }

    /// Whether this run is happening in an unattended automation
    /// environment.
    pub fn automation(&self) -> bool {
        self.automation
    }

    /// Whether failing units are queued for a sequential retry.
    ///
    /// `run_failures` mode disables retries unconditionally.
    pub fn retry_enabled(&self) -> bool {
        if self.run_failures {
            return false;
        }
        match self.retries {
            RetryPolicy::Automatic => self.automation,
            RetryPolicy::Never => false,
            RetryPolicy::Always => true,
        }
    }

    /// Whether this run executes only known failures, inverting the suite
    /// success condition.
    pub fn run_failures(&self) -> bool {
        self.run_failures
    }

    /// Whether every unit runs sequentially.
    pub fn sequential(&self) -> bool {
        self.sequential
    }

    /// Whether an interrupt kills the running unit but lets the sequential
    /// run continue.
    pub fn keep_going(&self) -> bool {
        self.keep_going
    }

    /// Whether subprocess output is forwarded live.
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Whether buffered output is replayed for attempts that will be
    /// retried.
    pub fn verbose_if_fails(&self) -> bool {
        self.verbose_if_fails
    }

    /// Whether the timeout watchdog is armed. It is skipped entirely for
    /// interactive runs and runs under an attached debugger.
    pub fn watchdog_enabled(&self) -> bool {
        !self.interactive && !self.under_debugger
    }

    /// The directory scratch directories are created under, if overridden.
    pub fn work_root(&self) -> Option<&Utf8Path> {
        self.work_root.as_deref()
    }
}

/// Builder for [`SuiteConfig`].
#[derive(Clone, Debug)]
pub struct SuiteConfigBuilder {
    config: SuiteConfig,
}

impl SuiteConfigBuilder {
    /// Creates a new builder for a suite that runs `program` once per unit.
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            config: SuiteConfig {
                program: program.into(),
                base_args: Vec::new(),
                extra_env: Vec::new(),
                test_threads: TestThreads::Detect,
                harness_timeout: DEFAULT_HARNESS_TIMEOUT,
                timeout_as_pass: false,
                race_detector: false,
                instrumented: false,
                crash_reporter: false,
                automation: is_ci::cached(),
                retries: RetryPolicy::Automatic,
                run_failures: false,
                sequential: false,
                keep_going: false,
                verbose: false,
                verbose_if_fails: false,
                interactive: false,
                under_debugger: false,
                work_root: None,
            },
        }
    }

    /// Sets the arguments passed to the program ahead of each unit's path.
    pub fn set_base_args(&mut self, args: impl IntoIterator<Item = String>) -> &mut Self {
        self.config.base_args = args.into_iter().collect();
        self
    }

    /// Adds an environment variable applied to every unit.
    pub fn add_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.config.extra_env.push((key.into(), value.into()));
        self
    }

    /// Sets the number of units run concurrently.
    pub fn set_test_threads(&mut self, test_threads: TestThreads) -> &mut Self {
        self.config.test_threads = test_threads;
        self
    }

    /// Sets the base per-unit timeout.
    pub fn set_harness_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.harness_timeout = timeout;
        self
    }

    /// Reports timeouts as `FAIL` rather than `TIMEOUT`.
    pub fn set_timeout_as_pass(&mut self, timeout_as_pass: bool) -> &mut Self {
        self.config.timeout_as_pass = timeout_as_pass;
        self
    }

    /// Marks the program as a race-detector build.
    pub fn set_race_detector(&mut self, race_detector: bool) -> &mut Self {
        self.config.race_detector = race_detector;
        self
    }

    /// Marks the program as a memory-hungry instrumented build.
    pub fn set_instrumented(&mut self, instrumented: bool) -> &mut Self {
        self.config.instrumented = instrumented;
        self
    }

    /// Enables crash-reporter integration.
    pub fn set_crash_reporter(&mut self, crash_reporter: bool) -> &mut Self {
        self.config.crash_reporter = crash_reporter;
        self
    }

    /// Overrides automation detection (the default comes from CI
    /// environment detection).
    pub fn set_automation(&mut self, automation: bool) -> &mut Self {
        self.config.automation = automation;
        self
    }

    /// Sets the retry policy.
    pub fn set_retries(&mut self, retries: RetryPolicy) -> &mut Self {
        self.config.retries = retries;
        self
    }

    /// Runs only known failures, inverting the suite success condition.
    pub fn set_run_failures(&mut self, run_failures: bool) -> &mut Self {
        self.config.run_failures = run_failures;
        self
    }

    /// Forces every unit onto the sequential queue.
    pub fn set_sequential(&mut self, sequential: bool) -> &mut Self {
        self.config.sequential = sequential;
        self
    }

    /// Keeps a sequential run going after an interrupt kills one unit.
    pub fn set_keep_going(&mut self, keep_going: bool) -> &mut Self {
        self.config.keep_going = keep_going;
        self
    }

    /// Forwards subprocess output live instead of buffering it.
    pub fn set_verbose(&mut self, verbose: bool) -> &mut Self {
        self.config.verbose = verbose;
        self
    }

    /// Replays buffered output for attempts that will be retried.
    pub fn set_verbose_if_fails(&mut self, verbose_if_fails: bool) -> &mut Self {
        self.config.verbose_if_fails = verbose_if_fails;
        self
    }

    /// Marks the run as interactive, which disarms the timeout watchdog.
    pub fn set_interactive(&mut self, interactive: bool) -> &mut Self {
        self.config.interactive = interactive;
        self
    }

    /// Marks the run as happening under an attached debugger, which disarms
    /// the timeout watchdog.
    pub fn set_under_debugger(&mut self, under_debugger: bool) -> &mut Self {
        self.config.under_debugger = under_debugger;
        self
    }

    /// Sets the directory scratch directories are created under.
    pub fn set_work_root(&mut self, work_root: impl Into<Utf8PathBuf>) -> &mut Self {
        self.config.work_root = Some(work_root.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> SuiteConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("detect", Ok(TestThreads::Detect); "detect keyword")]
    #[test_case("8", Ok(TestThreads::Count(8)); "positive")]
    #[test_case("0", Err(()); "zero")]
    #[test_case("-2", Err(()); "negative")]
    #[test_case("lots", Err(()); "garbage")]
    fn parse_test_threads(input: &str, expected: Result<TestThreads, ()>) {
        assert_eq!(input.parse::<TestThreads>().map_err(|_| ()), expected);
    }

    #[test]
    fn compute_test_threads() {
        assert_eq!(TestThreads::Count(7).compute(false), 7);
        // An explicit count is not adjusted for instrumented builds.
        assert_eq!(TestThreads::Count(7).compute(true), 7);

        let detected = TestThreads::Detect.compute(false);
        assert!(detected >= 1);
        let instrumented = TestThreads::Detect.compute(true);
        assert!(instrumented >= 2);
        assert!(instrumented <= detected.max(2));
    }

    #[test]
    fn retry_enabled_rules() {
        let mut builder = SuiteConfigBuilder::new("prog");
        builder
            .set_automation(true)
            .set_retries(RetryPolicy::Automatic);
        assert!(builder.clone().build().retry_enabled());

        builder.set_automation(false);
        assert!(!builder.clone().build().retry_enabled());

        builder.set_retries(RetryPolicy::Always);
        assert!(builder.clone().build().retry_enabled());

        // run_failures mode always wins.
        builder.set_run_failures(true);
        assert!(!builder.clone().build().retry_enabled());
    }

    #[test]
    fn watchdog_disarmed_for_debugging() {
        let mut builder = SuiteConfigBuilder::new("prog");
        assert!(builder.clone().build().watchdog_enabled());
        builder.set_under_debugger(true);
        assert!(!builder.clone().build().watchdog_enabled());
        builder.set_under_debugger(false).set_interactive(true);
        assert!(!builder.build().watchdog_enabled());
    }
}
