// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Classification of subprocess output.
//!
//! Test processes emit a mix of free-form text and newline-delimited JSON
//! records carrying an `action` field. Each line is decoded exactly once
//! into a [`ParsedLine`]; anything that is not a recognized structured
//! record passes through unchanged — raw output is never dropped.

use serde_json::{Map, Value};

/// `log` message marking the start of the test body.
pub const TEST_STARTED_MARKER: &str = "CHILD-TEST-STARTED";

/// `log` message marking the completion of the test body.
pub const TEST_COMPLETED_MARKER: &str = "CHILD-TEST-COMPLETED";

/// Actions recognized in structured output records.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogAction {
    /// The crash reporter finished initializing. One-shot; consulted during
    /// exit evaluation.
    CrashReporterInit,

    /// A structured test-status record.
    TestStatus,

    /// A log record with a severity level.
    Log,
}

impl LogAction {
    fn from_str(action: &str) -> Option<Self> {
        match action {
            "crash_reporter_init" => Some(Self::CrashReporterInit),
            "test_status" => Some(Self::TestStatus),
            "log" => Some(Self::Log),
            _ => None,
        }
    }
}

/// A structured output record.
#[derive(Clone, Debug)]
pub struct StructuredEvent {
    /// The recognized action.
    pub action: LogAction,

    /// All fields of the record, including `action`.
    pub fields: Map<String, Value>,
}

impl StructuredEvent {
    /// The `level` field, if present.
    pub fn level(&self) -> Option<&str> {
        self.fields.get("level").and_then(Value::as_str)
    }

    /// The `message` field, if present.
    pub fn message(&self) -> Option<&str> {
        self.fields.get("message").and_then(Value::as_str)
    }

    /// Whether the record carries an expected/actual mismatch.
    pub fn has_expected(&self) -> bool {
        self.fields.contains_key("expected")
    }
}

/// One line of subprocess output, decoded once.
#[derive(Clone, Debug)]
pub enum ParsedLine {
    /// A structured record with a recognized action.
    Structured(StructuredEvent),

    /// Anything else: free text, invalid JSON, JSON non-objects, and
    /// records with unrecognized actions.
    Text(String),
}

/// Decodes one line of raw output.
pub fn parse_line(line: &str) -> ParsedLine {
    let text = || ParsedLine::Text(line.to_owned());
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return text();
    };
    let Value::Object(fields) = value else {
        return text();
    };
    let Some(action) = fields.get("action").and_then(Value::as_str) else {
        return text();
    };
    match LogAction::from_str(action) {
        Some(action) => ParsedLine::Structured(StructuredEvent { action, fields }),
        None => text(),
    }
}

/// The buffered output of one unit, in arrival order.
#[derive(Clone, Debug, Default)]
pub struct UnitOutput {
    /// The raw lines.
    pub lines: Vec<String>,
}

impl UnitOutput {
    /// Returns true if no output was buffered.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Per-unit output state: buffers lines and tracks the markers consulted
/// during exit evaluation.
///
/// The failure flag is sticky: once evidence of a failure is seen it cannot
/// be unset for the lifetime of the run.
#[derive(Debug, Default)]
pub struct OutputClassifier {
    lines: Vec<String>,
    observed: usize,
    saw_crash_reporter_init: bool,
    saw_proc_start: bool,
    saw_proc_end: bool,
    has_failure_output: bool,
}

impl OutputClassifier {
    /// Creates an empty classifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes a single line of output, updating flags and buffering it.
    pub fn process_line(&mut self, raw: &str) {
        if raw.trim().is_empty() {
            return;
        }
        self.observed += 1;

        match parse_line(raw) {
            ParsedLine::Text(_) => self.lines.push(raw.to_owned()),
            ParsedLine::Structured(event) => {
                if event.action == LogAction::CrashReporterInit {
                    // One-shot marker; not re-emitted.
                    self.saw_crash_reporter_init = true;
                    return;
                }

                self.has_failure_output = self.has_failure_output
                    || event.has_expected()
                    || (event.action == LogAction::Log && event.level() == Some("ERROR"));

                if event.action == LogAction::Log {
                    match event.message() {
                        Some(TEST_STARTED_MARKER) => self.saw_proc_start = true,
                        Some(TEST_COMPLETED_MARKER) => self.saw_proc_end = true,
                        _ => {}
                    }
                }

                self.lines.push(raw.to_owned());
            }
        }
    }

    /// Called at end of stream. Output that started the test body but never
    /// completed it is failure evidence.
    pub fn finish(&mut self) {
        if self.saw_proc_start && !self.saw_proc_end {
            self.has_failure_output = true;
        }
    }

    /// Whether the crash-reporter-initialized marker was observed.
    pub fn saw_crash_reporter_init(&self) -> bool {
        self.saw_crash_reporter_init
    }

    /// Whether any failure evidence was observed.
    pub fn has_failure_output(&self) -> bool {
        self.has_failure_output
    }

    /// Whether any non-blank output was observed at all (including swallowed
    /// markers).
    pub fn saw_output(&self) -> bool {
        self.observed > 0
    }

    /// Consumes the classifier, returning the buffered output.
    pub fn into_output(self) -> UnitOutput {
        UnitOutput { lines: self.lines }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("plain text"; "free text")]
    #[test_case("{not json"; "invalid json")]
    #[test_case("[1, 2, 3]"; "json non-object")]
    #[test_case(r#"{"message": "no action"}"#; "object without action")]
    #[test_case(r#"{"action": "screenshot"}"#; "unrecognized action")]
    fn parse_line_text_passthrough(line: &str) {
        match parse_line(line) {
            ParsedLine::Text(text) => assert_eq!(text, line),
            ParsedLine::Structured(event) => panic!("expected text, got {event:?}"),
        }
    }

    #[test]
    fn parse_line_structured() {
        let ParsedLine::Structured(event) =
            parse_line(r#"{"action": "log", "level": "INFO", "message": "hi"}"#)
        else {
            panic!("expected a structured record");
        };
        assert_eq!(event.action, LogAction::Log);
        assert_eq!(event.level(), Some("INFO"));
        assert_eq!(event.message(), Some("hi"));
        assert!(!event.has_expected());
    }

    #[test]
    fn blank_lines_are_ignored() {
        let mut classifier = OutputClassifier::new();
        classifier.process_line("");
        classifier.process_line("   \t");
        assert!(!classifier.saw_output());
        assert!(classifier.into_output().is_empty());
    }

    #[test]
    fn crash_reporter_marker_is_swallowed() {
        let mut classifier = OutputClassifier::new();
        classifier.process_line(r#"{"action": "crash_reporter_init"}"#);
        assert!(classifier.saw_crash_reporter_init());
        assert!(classifier.saw_output());
        assert!(!classifier.has_failure_output());
        assert!(classifier.into_output().is_empty());
    }

    #[test]
    fn error_log_sets_sticky_failure_flag() {
        let mut classifier = OutputClassifier::new();
        classifier.process_line(r#"{"action": "log", "level": "INFO", "message": "fine"}"#);
        assert!(!classifier.has_failure_output());
        classifier.process_line(r#"{"action": "log", "level": "ERROR", "message": "boom"}"#);
        assert!(classifier.has_failure_output());
        // Nothing un-sets it.
        classifier.process_line(r#"{"action": "log", "level": "INFO", "message": "ok now"}"#);
        classifier.finish();
        assert!(classifier.has_failure_output());
    }

    #[test]
    fn expected_field_sets_failure_flag() {
        let mut classifier = OutputClassifier::new();
        classifier.process_line(
            r#"{"action": "test_status", "status": "FAIL", "expected": "PASS"}"#,
        );
        assert!(classifier.has_failure_output());
    }

    #[test]
    fn unbalanced_start_marker_is_failure_evidence() {
        let mut classifier = OutputClassifier::new();
        classifier.process_line(&format!(
            r#"{{"action": "log", "level": "INFO", "message": "{TEST_STARTED_MARKER}"}}"#
        ));
        classifier.finish();
        assert!(classifier.has_failure_output());

        let mut classifier = OutputClassifier::new();
        classifier.process_line(&format!(
            r#"{{"action": "log", "level": "INFO", "message": "{TEST_STARTED_MARKER}"}}"#
        ));
        classifier.process_line(&format!(
            r#"{{"action": "log", "level": "INFO", "message": "{TEST_COMPLETED_MARKER}"}}"#
        ));
        classifier.finish();
        assert!(!classifier.has_failure_output());
    }

    #[test]
    fn buffered_output_preserves_arrival_order() {
        let mut classifier = OutputClassifier::new();
        classifier.process_line("first");
        classifier.process_line(r#"{"action": "log", "level": "INFO", "message": "second"}"#);
        classifier.process_line("third");
        let output = classifier.into_output();
        assert_eq!(output.lines.len(), 3);
        assert_eq!(output.lines[0], "first");
        assert_eq!(output.lines[2], "third");
    }
}
