//! ScriptedProvider - deterministic LLM responses for testing
//!
//! Each call to `complete_stream` pops the next scripted turn; an exhausted
//! script returns a default text response. Used by the engine and supervisor
//! test suites to exercise tool rounds without a network.

use crate::provider::{LlmError, LlmProvider, LlmResult, LlmStream};
use crate::types::{LlmRequest, StreamDelta, Usage};
use async_stream::stream;
use serde_json::Value;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// One scripted assistant turn.
#[derive(Clone, Debug)]
pub enum ScriptedTurn {
    /// Text-only response.
    Text(String),
    /// Text (possibly empty) followed by tool calls.
    ToolCalls {
        text: String,
        calls: Vec<(String, Value)>,
    },
    /// The stream opens, then fails mid-way.
    StreamError(String),
}

enum ScriptEntry {
    Turn(ScriptedTurn),
    OpenFailure(LlmError),
}

pub struct ScriptedProvider {
    script: Mutex<Vec<ScriptEntry>>,
    calls_made: Mutex<usize>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            calls_made: Mutex::new(0),
        }
    }

    pub fn with_turn(self, turn: ScriptedTurn) -> Self {
        self.script
            .lock()
            .unwrap()
            .push(ScriptEntry::Turn(turn));
        self
    }

    pub fn with_text_turn(self, text: impl Into<String>) -> Self {
        self.with_turn(ScriptedTurn::Text(text.into()))
    }

    pub fn with_tool_turn(self, name: impl Into<String>, args: Value) -> Self {
        self.with_turn(ScriptedTurn::ToolCalls {
            text: String::new(),
            calls: vec![(name.into(), args)],
        })
    }

    /// The next `complete_stream` call fails before any delta is produced.
    pub fn with_open_failure(self, error: LlmError) -> Self {
        self.script
            .lock()
            .unwrap()
            .push(ScriptEntry::OpenFailure(error));
        self
    }

    pub fn calls_made(&self) -> usize {
        *self.calls_made.lock().unwrap()
    }

    fn next_entry(&self) -> ScriptEntry {
        *self.calls_made.lock().unwrap() += 1;
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            ScriptEntry::Turn(ScriptedTurn::Text("(script exhausted)".into()))
        } else {
            script.remove(0)
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete_stream(
        &self,
        _request: LlmRequest,
        _cancel: CancellationToken,
    ) -> LlmResult<LlmStream> {
        let turn = match self.next_entry() {
            ScriptEntry::OpenFailure(e) => return Err(e),
            ScriptEntry::Turn(t) => t,
        };

        let s = stream! {
            match turn {
                ScriptedTurn::Text(text) => {
                    // Chunk the text like a real stream would.
                    for chunk in text.as_bytes().chunks(16) {
                        yield Ok(StreamDelta::Text(String::from_utf8_lossy(chunk).to_string()));
                    }
                    yield Ok(StreamDelta::Done {
                        stop_reason: Some("end_turn".into()),
                        usage: Some(Usage { input_tokens: 10, output_tokens: text.len() as u32 / 4 }),
                    });
                }
                ScriptedTurn::ToolCalls { text, calls } => {
                    if !text.is_empty() {
                        yield Ok(StreamDelta::Text(text));
                    }
                    for (i, (name, args)) in calls.into_iter().enumerate() {
                        let id = format!("toolu_{:04}", i);
                        yield Ok(StreamDelta::ToolCallStart { id: id.clone(), name });
                        yield Ok(StreamDelta::ToolCallDelta {
                            id: id.clone(),
                            arguments: args.to_string(),
                        });
                        yield Ok(StreamDelta::ToolCallEnd { id });
                    }
                    yield Ok(StreamDelta::Done {
                        stop_reason: Some("tool_use".into()),
                        usage: Some(Usage { input_tokens: 10, output_tokens: 10 }),
                    });
                }
                ScriptedTurn::StreamError(message) => {
                    yield Ok(StreamDelta::Text("partial".into()));
                    yield Err(LlmError::StreamError(message));
                }
            }
        };

        Ok(Box::pin(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn scripted_turns_pop_in_order() {
        let provider = ScriptedProvider::new()
            .with_text_turn("one")
            .with_tool_turn("read_file", serde_json::json!({"path": "a.txt"}));

        let mut s1 = provider
            .complete_stream(LlmRequest::default(), CancellationToken::new())
            .await
            .unwrap();
        let mut text = String::new();
        while let Some(Ok(d)) = s1.next().await {
            if let StreamDelta::Text(t) = d {
                text.push_str(&t);
            }
        }
        assert_eq!(text, "one");

        let mut s2 = provider
            .complete_stream(LlmRequest::default(), CancellationToken::new())
            .await
            .unwrap();
        let mut saw_tool = false;
        while let Some(Ok(d)) = s2.next().await {
            if let StreamDelta::ToolCallStart { name, .. } = d {
                assert_eq!(name, "read_file");
                saw_tool = true;
            }
        }
        assert!(saw_tool);
        assert_eq!(provider.calls_made(), 2);
    }
}
