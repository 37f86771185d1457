//! Core types shared across the workspace

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Session identifier - cheaply cloneable, 128-bit random when minted fresh.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct SessionId(Arc<str>);

impl SessionId {
    pub fn mint() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Serialize for SessionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(s))
    }
}

/// Message role
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Message content - plain text or a synthesized compaction summary.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: String },
    Summary { text: String, covers: usize },
}

impl MessageContent {
    pub fn text(&self) -> &str {
        match self {
            Self::Text { text } | Self::Summary { text, .. } => text,
        }
    }
}

/// A message in a conversation.
///
/// Assistant messages may carry tool calls; tool-role messages carry the
/// call id they answer. Immutable once appended to a context log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(tool_calls),
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }

    pub fn summary(text: impl Into<String>, covers: usize) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Summary {
                text: text.into(),
                covers,
            },
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text {
                text: content.into(),
            },
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn text(&self) -> &str {
        self.content.text()
    }
}

/// A tool call emitted by the assistant. Immutable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// The outcome of one tool invocation. Immutable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub ok: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified_paths: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub retryable: bool,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            ok: true,
            output: output.into(),
            error: None,
            modified_paths: Vec::new(),
            exit_code: None,
            truncated: false,
            retryable: false,
        }
    }

    pub fn failure(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            call_id: call_id.into(),
            ok: false,
            output: String::new(),
            error: Some(error),
            modified_paths: Vec::new(),
            exit_code: None,
            truncated: false,
            retryable: false,
        }
    }

    pub fn with_modified(mut self, paths: Vec<PathBuf>) -> Self {
        self.modified_paths = paths;
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Render the result as the string fed back to the model.
    pub fn content_string(&self) -> String {
        match &self.error {
            Some(e) if self.output.is_empty() => format!("Error: {}", e),
            Some(e) => format!("Error: {}\n{}", e, self.output),
            None => self.output.clone(),
        }
    }
}

/// Cumulative token usage for a session.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Approval policy for tool invocations.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    Yolo,
    #[default]
    Auto,
    AutoEdit,
    OnRequest,
    OnFailure,
    Never,
}

impl std::str::FromStr for ApprovalPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yolo" => Ok(Self::Yolo),
            "auto" => Ok(Self::Auto),
            "auto-edit" => Ok(Self::AutoEdit),
            "on-request" => Ok(Self::OnRequest),
            "on-failure" => Ok(Self::OnFailure),
            "never" => Ok(Self::Never),
            other => Err(format!("unknown approval policy: {}", other)),
        }
    }
}

impl std::fmt::Display for ApprovalPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Yolo => "yolo",
            Self::Auto => "auto",
            Self::AutoEdit => "auto-edit",
            Self::OnRequest => "on-request",
            Self::OnFailure => "on-failure",
            Self::Never => "never",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_mint_is_unique() {
        let a = SessionId::mint();
        let b = SessionId::mint();
        assert_ne!(a, b);
        assert!(a.as_str().len() >= 32);
    }

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);
        let tr = Message::tool_result("tc-1", "out");
        assert_eq!(tr.role, Role::Tool);
        assert_eq!(tr.tool_call_id.as_deref(), Some("tc-1"));
    }

    #[test]
    fn tool_result_content_string() {
        let ok = ToolResult::ok("tc", "hello");
        assert_eq!(ok.content_string(), "hello");
        let err = ToolResult::failure("tc", "boom");
        assert_eq!(err.content_string(), "Error: boom");
    }

    #[test]
    fn approval_policy_round_trip() {
        for s in ["yolo", "auto", "auto-edit", "on-request", "on-failure", "never"] {
            let p: ApprovalPolicy = s.parse().unwrap();
            assert_eq!(p.to_string(), s);
        }
        assert!("bogus".parse::<ApprovalPolicy>().is_err());
    }
}
