// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner.
//!
//! Dispatch is split in two: the executor runs units in subprocesses, and
//! the dispatcher folds their outcomes into the suite aggregate and talks
//! to the outside world. The main structure in this module is
//! [`TestRunner`].

mod dispatcher;
mod executor;
mod imp;
mod internal_events;

pub use self::imp::{TestRunner, TestRunnerBuilder};
