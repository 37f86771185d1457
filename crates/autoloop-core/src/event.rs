//! Event schema for the engine → consumer stream
//!
//! Consumers may project these records straight to a line-delimited stream
//! (SSE or a local pipe) without further framing.

use crate::error::ErrorReport;
use crate::types::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a turn ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnEndReason {
    Completed,
    ToolBudgetExhausted,
    Cancelled,
    Error,
}

/// Event payloads, tagged by type.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    AgentStart,
    TextDelta {
        text: String,
    },
    TextComplete {
        text: String,
    },
    ToolCallStart {
        call_id: String,
        name: String,
    },
    ToolCallComplete {
        call_id: String,
        name: String,
        ok: bool,
        /// Full untruncated output, exposed to consumers exactly once.
        output: String,
    },
    AgentError {
        error: ErrorReport,
    },
    AgentEnd {
        reason: TurnEndReason,
    },
    LoopStateChange {
        state: String,
    },
    /// Injected into a lagging subscriber's stream after dropped events.
    Backpressure,
}

/// One record on the event stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineEvent {
    pub seq: u64,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl EngineEvent {
    pub fn new(seq: u64, session_id: SessionId, kind: EventKind) -> Self {
        Self {
            seq,
            session_id,
            timestamp: Utc::now(),
            kind,
        }
    }
}
