// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured, machine-readable run output.
//!
//! Emits newline-delimited JSON records (`suite_start`, `test_start`,
//! `test_end`, `suite_end`) to an injected sink. Attempts that will be
//! retried produce no `test_end` record; only the final attempt of each
//! unit is reported, so consumers see exactly one terminal record per unit.

use super::events::{TestEvent, TestEventKind};
use serde_json::json;
use std::io::{self, Write};

/// Writes structured run records to a sink.
#[derive(Debug)]
pub struct StructuredReporter<W> {
    writer: W,
    suite_name: String,
}

impl<W: Write> StructuredReporter<W> {
    /// Creates a reporter writing to `writer`.
    pub fn new(writer: W, suite_name: impl Into<String>) -> Self {
        Self {
            writer,
            suite_name: suite_name.into(),
        }
    }

    /// Writes the record for one event, if the event has one.
    pub fn write_event(&mut self, event: &TestEvent<'_>) -> io::Result<()> {
        let time = event.timestamp.timestamp_millis();
        let record = match &event.kind {
            TestEventKind::RunStarted { test_list, run_id } => json!({
                "action": "suite_start",
                "name": self.suite_name,
                "run_id": run_id.to_string(),
                "tests": test_list.groups(),
                "time": time,
            }),
            TestEventKind::TestStarted { test_unit, .. } => json!({
                "action": "test_start",
                "id": test_unit.id.as_str(),
                "group": test_unit.group,
                "time": time,
            }),
            TestEventKind::TestSkipped { test_unit, reason } => {
                // Skipped units still get a start/end pair.
                let start = json!({
                    "action": "test_start",
                    "id": test_unit.id.as_str(),
                    "group": test_unit.group,
                    "time": time,
                });
                serde_json::to_writer(&mut self.writer, &start)?;
                self.writer.write_all(b"\n")?;
                json!({
                    "action": "test_end",
                    "id": test_unit.id.as_str(),
                    "group": test_unit.group,
                    "status": "SKIP",
                    "expected": test_unit.expected.status_str(),
                    "message": reason,
                    "time": time,
                })
            }
            TestEventKind::TestFinished {
                test_unit,
                run_status,
                ..
            } => json!({
                "action": "test_end",
                "id": test_unit.id.as_str(),
                "group": test_unit.group,
                "status": run_status.result.status_str(),
                "expected": run_status.expected.status_str(),
                "message": run_status.message,
                "time": time,
            }),
            TestEventKind::TestInfraFailed { test_unit, error } => json!({
                "action": "test_end",
                "id": test_unit.id.as_str(),
                "group": test_unit.group,
                "status": "ERROR",
                "expected": test_unit.expected.status_str(),
                "message": error.to_string(),
                "time": time,
            }),
            TestEventKind::RunFinished { run_id, .. } => {
                let record = json!({
                    "action": "suite_end",
                    "name": self.suite_name,
                    "run_id": run_id.to_string(),
                    "time": time,
                });
                serde_json::to_writer(&mut self.writer, &record)?;
                self.writer.write_all(b"\n")?;
                return self.writer.flush();
            }
            // Withheld: retried attempts are only reported through their
            // final attempt. Other events carry no structured record.
            _ => return Ok(()),
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        classify::UnitOutput,
        list::{ExpectedOutcome, ListSettings, Manifest, TestDef, TestList},
        reporter::events::{ExecuteStatus, ExecutionResult, RunStats},
    };
    use chrono::Local;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn event(kind: TestEventKind<'_>) -> TestEvent<'_> {
        TestEvent {
            timestamp: Local::now().fixed_offset(),
            elapsed: Duration::ZERO,
            kind,
        }
    }

    #[test]
    fn records_round_trip() {
        let mut manifest = Manifest::default();
        manifest.tests.push(TestDef::new("a.sh"));
        let list = TestList::new(manifest, &ListSettings::default());
        let test_unit = &list.units()[0];

        let run_status = ExecuteStatus {
            attempt: 1,
            result: ExecutionResult::Fail,
            expected: ExpectedOutcome::Pass,
            pid: Some(1),
            exit_code: Some(1),
            output: UnitOutput::default(),
            start_time: Local::now(),
            time_taken: Duration::from_millis(5),
            message: "exit code: 1".to_owned(),
        };

        let mut buf = Vec::new();
        {
            let mut reporter = StructuredReporter::new(&mut buf, "suite");
            let run_id = uuid::Uuid::new_v4();
            reporter
                .write_event(&event(TestEventKind::RunStarted {
                    test_list: &list,
                    run_id,
                }))
                .unwrap();
            reporter
                .write_event(&event(TestEventKind::TestStarted {
                    test_unit,
                    attempt: 1,
                    current_stats: RunStats::default(),
                    running: 1,
                    cancel_state: None,
                }))
                .unwrap();
            // A will-retry attempt is withheld.
            reporter
                .write_event(&event(TestEventKind::TestAttemptFailedWillRetry {
                    test_unit,
                    run_status: run_status.clone(),
                }))
                .unwrap();
            reporter
                .write_event(&event(TestEventKind::TestFinished {
                    test_unit,
                    run_status,
                    current_stats: RunStats::default(),
                    running: 0,
                    cancel_state: None,
                }))
                .unwrap();
            reporter
                .write_event(&event(TestEventKind::RunFinished {
                    run_id,
                    start_time: Local::now().fixed_offset(),
                    elapsed: Duration::from_secs(1),
                    run_stats: RunStats::default(),
                }))
                .unwrap();
        }

        let text = String::from_utf8(buf).unwrap();
        let actions: Vec<String> = text
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["action"].as_str().unwrap().to_owned()
            })
            .collect();
        assert_eq!(actions, ["suite_start", "test_start", "test_end", "suite_end"]);

        let test_end: serde_json::Value =
            serde_json::from_str(text.lines().nth(2).unwrap()).unwrap();
        assert_eq!(test_end["id"], "a.sh");
        assert_eq!(test_end["status"], "FAIL");
        assert_eq!(test_end["expected"], "PASS");
    }
}
