//! Error taxonomy for the runtime
//!
//! Per-call errors become tool results, per-turn errors end the turn, fatal
//! errors halt the supervisor. Every error can be projected to an
//! `ErrorReport` carrying a stable machine code, a trace id, and its
//! retryable flag.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("validation failed for tool '{tool}': {message}")]
    Validation { tool: String, message: String },

    #[error("tool '{tool}' failed: {message}")]
    ToolExecution {
        tool: String,
        message: String,
        retryable: bool,
    },

    #[error("tool '{tool}' timed out after {deadline_ms}ms")]
    ToolTimeout { tool: String, deadline_ms: u64 },

    #[error("approval denied for tool '{tool}': {reason}")]
    ApprovalDenied { tool: String, reason: String },

    #[error("path escapes workspace: {path}")]
    PathTraversal { path: String },

    #[error("dangerous command rejected: {pattern}")]
    DangerousCommand { pattern: String },

    #[error("llm transient failure: {0}")]
    LlmTransient(String),

    #[error("llm fatal failure: {0}")]
    LlmFatal(String),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("rate limit exhausted")]
    RateLimited,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("repetition loop detected: {action}")]
    LoopDetected { action: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short machine-readable code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Validation { .. } => "validation",
            Self::ToolExecution { .. } => "tool_execution",
            Self::ToolTimeout { .. } => "tool_timeout",
            Self::ApprovalDenied { .. } => "approval_denied",
            Self::PathTraversal { .. } => "path_traversal",
            Self::DangerousCommand { .. } => "dangerous_command",
            Self::LlmTransient(_) => "llm_transient",
            Self::LlmFatal(_) => "llm_fatal",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionExpired(_) => "session_expired",
            Self::LoopDetected { .. } => "loop_detected",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            Self::LlmTransient(_) => true,
            Self::ToolExecution { retryable, .. } => *retryable,
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Project into the wire shape used by `agent_error` events and halt logs.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code().to_string(),
            message: self.to_string(),
            trace_id: Uuid::new_v4().to_string(),
            retryable: self.retryable(),
        }
    }
}

/// Wire-level error record: code + human message + trace id + retryable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    pub trace_id: String,
    pub retryable: bool,
}
