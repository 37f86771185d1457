//! Autoloop core — shared types, error taxonomy, and event schema
//!
//! Leaf crate of the workspace. Everything here is plain data: the engine,
//! tools, and supervisor crates all build on these definitions.

pub mod error;
pub mod event;
pub mod types;

pub use error::{Error, ErrorReport, Result};
pub use event::{EngineEvent, EventKind, TurnEndReason};
pub use types::{
    ApprovalPolicy, Message, MessageContent, Role, SessionId, TokenUsage, ToolCall, ToolResult,
};
