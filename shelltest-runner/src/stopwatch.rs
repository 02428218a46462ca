// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stopwatch for tracking how long it takes to run tests.
//!
//! Tests need to track a start time and a duration. For that we use a
//! combination of a realtime clock (for the start time) and a monotonic clock
//! (for the duration).

use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub(crate) struct StopwatchStart {
    start_time: DateTime<Local>,
    instant: Instant,
}

impl StopwatchStart {
    pub(crate) fn now() -> Self {
        Self {
            // These two syscalls happen imperceptibly close to each other,
            // which is good enough for our purposes.
            start_time: Local::now(),
            instant: Instant::now(),
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.instant.elapsed()
    }

    pub(crate) fn end(&self) -> StopwatchEnd {
        StopwatchEnd {
            start_time: self.start_time,
            duration: self.instant.elapsed(),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct StopwatchEnd {
    pub(crate) start_time: DateTime<Local>,
    pub(crate) duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopwatch_end_is_monotonic() {
        let start = StopwatchStart::now();
        std::thread::sleep(Duration::from_millis(50));
        let end = start.end();
        assert!(
            end.duration >= Duration::from_millis(50),
            "expected at least 50ms to have elapsed, got {:?}",
            end.duration
        );
        assert!(start.elapsed() >= end.duration);
    }
}
