// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by shelltest.

use crate::list::TestId;
use std::{io, sync::Arc};
use thiserror::Error;

/// An error that occurred while building a
/// [`TestRunner`](crate::runner::TestRunner).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunnerBuildError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] io::Error),

    /// An error occurred while setting up signal handlers.
    #[error("error setting up signal handlers")]
    SignalHandlerSetup(#[source] io::Error),
}

/// An error returned while parsing a test manifest.
#[derive(Debug, Error)]
#[error("error parsing test manifest")]
pub struct ManifestParseError {
    #[source]
    pub(crate) error: toml::de::Error,
}

/// Error returned while parsing a
/// [`TestThreads`](crate::config::TestThreads) value from a string.
#[derive(Clone, Debug, Error)]
#[error("unrecognized test-threads value: {input}\n(expected a positive integer or \"detect\")")]
pub struct TestThreadsParseError {
    input: String,
}

impl TestThreadsParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// Error returned while parsing a
/// [`RetryPolicy`](crate::config::RetryPolicy) value from a string.
#[derive(Clone, Debug, Error)]
#[error("unrecognized retry policy: {input}\n(known values: automatic, never, always)")]
pub struct RetryPolicyParseError {
    input: String,
}

impl RetryPolicyParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An infrastructure-level failure in a runner task.
///
/// Unlike an ordinary test failure, an infrastructure error means the harness
/// could not carry out the unit's execution at all. The scheduler stops
/// dispatching new units once one of these occurs, and the collected errors
/// are re-raised to the caller as [`InfraErrors`] after in-flight units
/// finish.
///
/// The source errors are stored as `Arc<io::Error>` so statuses stay
/// cloneable across the event pipeline.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum InfraError {
    /// The test process could not be spawned.
    #[error("error spawning test process for `{unit_id}`")]
    Spawn {
        /// The unit that could not be spawned.
        unit_id: TestId,
        /// The underlying error.
        #[source]
        error: Arc<io::Error>,
    },

    /// The per-unit scratch directories could not be set up.
    #[error("error setting up scratch directories for `{unit_id}`")]
    Scratch {
        /// The unit being set up.
        unit_id: TestId,
        /// The underlying error.
        #[source]
        error: Arc<io::Error>,
    },

    /// Reading the test process's output failed.
    #[error("error reading output of `{unit_id}`")]
    Read {
        /// The unit whose output could not be read.
        unit_id: TestId,
        /// The underlying error.
        #[source]
        error: Arc<io::Error>,
    },

    /// Waiting on the test process failed.
    #[error("error waiting on test process for `{unit_id}`")]
    Wait {
        /// The unit being waited on.
        unit_id: TestId,
        /// The underlying error.
        #[source]
        error: Arc<io::Error>,
    },
}

impl InfraError {
    /// Returns the id of the unit this error occurred in.
    pub fn unit_id(&self) -> &TestId {
        match self {
            Self::Spawn { unit_id, .. }
            | Self::Scratch { unit_id, .. }
            | Self::Read { unit_id, .. }
            | Self::Wait { unit_id, .. } => unit_id,
        }
    }
}

/// One or more [`InfraError`]s collected over a test run.
///
/// Returned by [`TestRunner::execute`](crate::runner::TestRunner::execute)
/// after all in-flight units have finished.
#[derive(Debug, Error)]
#[error("{} infrastructure error(s) occurred while running tests", .errors.len())]
pub struct InfraErrors {
    errors: Vec<InfraError>,
}

impl InfraErrors {
    pub(crate) fn new(errors: Vec<InfraError>) -> Self {
        debug_assert!(!errors.is_empty(), "InfraErrors must be non-empty");
        Self { errors }
    }

    /// The individual errors, in the order they occurred.
    pub fn errors(&self) -> &[InfraError] {
        &self.errors
    }
}
