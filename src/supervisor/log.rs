//! Machine-readable run log on stderr
//!
//! One JSON line per supervisor lifecycle event. Records are typed against
//! the loop's own domain (iterations, circuit state, halt reasons) so the
//! wire shape cannot drift from what the supervisor actually tracks;
//! `tracing` remains the human-facing channel.

use crate::supervisor::circuit::CircuitState;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunLogRecord<'a> {
    SupervisorStarted {
        session_id: &'a str,
        max_iterations: u64,
        calls_remaining: u32,
    },
    IterationStarted {
        iteration: u64,
    },
    IterationCompleted {
        iteration: u64,
        exit_signal: bool,
        completion_indicators: usize,
        has_errors: bool,
        circuit: CircuitState,
    },
    SupervisorHalted {
        reason: &'static str,
        iterations: u64,
    },
}

#[derive(Debug, Serialize)]
struct RunLogLine<'a> {
    ts: DateTime<Utc>,
    #[serde(flatten)]
    record: RunLogRecord<'a>,
}

fn render(record: RunLogRecord<'_>) -> Option<String> {
    serde_json::to_string(&RunLogLine {
        ts: Utc::now(),
        record,
    })
    .ok()
}

pub fn emit(record: RunLogRecord<'_>) {
    if let Some(json) = render(record) {
        eprintln!("{json}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_serialize_with_event_tag_and_timestamp() {
        let line = render(RunLogRecord::IterationCompleted {
            iteration: 4,
            exit_signal: false,
            completion_indicators: 1,
            has_errors: true,
            circuit: CircuitState::Closed,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "iteration_completed");
        assert_eq!(value["iteration"], 4);
        assert_eq!(value["circuit"], "closed");
        assert!(value["ts"].is_string());
    }

    #[test]
    fn halt_record_carries_reason() {
        let line = render(RunLogRecord::SupervisorHalted {
            reason: "rate_limited",
            iterations: 3,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "supervisor_halted");
        assert_eq!(value["reason"], "rate_limited");
    }
}
