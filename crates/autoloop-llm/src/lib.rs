//! Autoloop LLM — provider abstraction, Anthropic SSE adapter, retry budget
//!
//! The driver consumes a context snapshot and streams deltas; it never
//! mutates conversation state. Transient provider failures retry under a
//! process-wide budget so a failing upstream cannot cause a retry storm.

pub mod anthropic;
pub mod driver;
pub mod mock;
pub mod provider;
pub mod retry;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use driver::{DriverConfig, LlmDriver};
pub use mock::ScriptedProvider;
pub use provider::{LlmError, LlmProvider, LlmResult, LlmStream};
pub use retry::RetryBudget;
pub use types::{
    AccumulatedToolCall, ContentBlock, LlmContent, LlmMessage, LlmRequest, LlmTool, StreamDelta,
    Usage,
};
