//! Wire types for requests and streaming responses

use autoloop_core::{Message, MessageContent, Role, ToolCall};
use serde::{Deserialize, Serialize};

/// LLM request
#[derive(Clone, Debug, Serialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<LlmMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<LlmTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            messages: Vec::new(),
            tools: None,
            max_tokens: Some(8192),
            temperature: None,
            system: None,
        }
    }
}

/// Message in wire format
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: LlmContent,
}

/// Message content - string or array of blocks
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LlmContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Content block types
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// Tool definition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Streaming delta from the provider
#[derive(Clone, Debug)]
pub enum StreamDelta {
    Text(String),
    Thinking(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, arguments: String },
    ToolCallEnd { id: String },
    Done { stop_reason: Option<String>, usage: Option<Usage> },
    Error(String),
}

/// Token usage reported by the provider
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

/// Accumulated tool call from streaming
#[derive(Clone, Debug, Default)]
pub struct AccumulatedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl AccumulatedToolCall {
    pub fn parse_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(&self.arguments)
    }

    pub fn into_tool_call(self) -> ToolCall {
        let arguments = self.parse_arguments().unwrap_or_default();
        ToolCall {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

/// Convert the engine's message log into provider wire format.
///
/// Assistant tool calls become `tool_use` blocks; consecutive tool-role
/// messages collapse into a single user message of `tool_result` blocks
/// (the provider requires all results for a turn in one message). System
/// messages are skipped here - the system prompt travels in the request.
pub fn to_wire(messages: &[Message]) -> Vec<LlmMessage> {
    let mut wire: Vec<LlmMessage> = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System => continue,
            Role::User => {
                let text = render_user_text(msg);
                // Merge adjacent user text so roles alternate lawfully even
                // after compaction inserts a summary message.
                match wire.last_mut() {
                    Some(LlmMessage {
                        role,
                        content: LlmContent::Text(existing),
                    }) if role.as_str() == "user" => {
                        existing.push_str("\n\n");
                        existing.push_str(&text);
                    }
                    _ => wire.push(LlmMessage {
                        role: "user".into(),
                        content: LlmContent::Text(text),
                    }),
                }
            }
            Role::Assistant => {
                let text = msg.text();
                match &msg.tool_calls {
                    Some(calls) if !calls.is_empty() => {
                        let mut blocks = Vec::new();
                        if !text.is_empty() {
                            blocks.push(ContentBlock::Text { text: text.into() });
                        }
                        blocks.extend(calls.iter().map(|tc| ContentBlock::ToolUse {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                            input: tc.arguments.clone(),
                        }));
                        wire.push(LlmMessage {
                            role: "assistant".into(),
                            content: LlmContent::Blocks(blocks),
                        });
                    }
                    _ => wire.push(LlmMessage {
                        role: "assistant".into(),
                        content: LlmContent::Text(text.into()),
                    }),
                }
            }
            Role::Tool => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.text().into(),
                    is_error: None,
                };
                // Append to an existing tool_result user message when possible.
                let appended = match wire.last_mut() {
                    Some(LlmMessage {
                        role,
                        content: LlmContent::Blocks(blocks),
                    }) if role.as_str() == "user"
                        && blocks
                            .iter()
                            .any(|b| matches!(b, ContentBlock::ToolResult { .. })) =>
                    {
                        blocks.push(block.clone());
                        true
                    }
                    _ => false,
                };
                if !appended {
                    wire.push(LlmMessage {
                        role: "user".into(),
                        content: LlmContent::Blocks(vec![block]),
                    });
                }
            }
        }
    }

    wire
}

fn render_user_text(msg: &Message) -> String {
    match &msg.content {
        MessageContent::Summary { text, covers } => format!(
            "[conversation summary covering {} earlier messages]\n{}",
            covers, text
        ),
        MessageContent::Text { text } => text.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoloop_core::Message;

    #[test]
    fn accumulated_empty_arguments_parse_as_object() {
        let acc = AccumulatedToolCall {
            id: "tc-1".into(),
            name: "read_file".into(),
            arguments: String::new(),
        };
        assert!(acc.parse_arguments().unwrap().is_object());
    }

    #[test]
    fn to_wire_collapses_tool_results() {
        let messages = vec![
            Message::user("do it"),
            Message::assistant_with_tools(
                "",
                vec![
                    ToolCall {
                        id: "a".into(),
                        name: "read_file".into(),
                        arguments: serde_json::json!({}),
                    },
                    ToolCall {
                        id: "b".into(),
                        name: "list_glob".into(),
                        arguments: serde_json::json!({}),
                    },
                ],
            ),
            Message::tool_result("a", "ra"),
            Message::tool_result("b", "rb"),
        ];
        let wire = to_wire(&messages);
        assert_eq!(wire.len(), 3); // user, assistant, single tool-result user msg
        match &wire[2].content {
            LlmContent::Blocks(blocks) => assert_eq!(blocks.len(), 2),
            _ => panic!("expected blocks"),
        }
    }

    #[test]
    fn to_wire_skips_system_role() {
        let messages = vec![Message::system("sys"), Message::user("hi")];
        assert_eq!(to_wire(&messages).len(), 1);
    }
}
