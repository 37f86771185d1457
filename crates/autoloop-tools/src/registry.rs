//! Tool contract and registry
//!
//! A tool descriptor carries a unique name, a typed parameter list (from
//! which the JSON schema sent to the model is generated), capability flags
//! consumed by the safety gate, and an async handler. Registration happens
//! once at startup through `RegistryBuilder`; the built registry is
//! immutable and lookup is O(1).

use autoloop_llm::LlmTool;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Capability flags consulted by the safety gate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub reads_fs: bool,
    pub writes_fs: bool,
    pub executes_process: bool,
    pub network: bool,
    pub destructive: bool,
}

impl Capabilities {
    pub const fn read_only() -> Self {
        Self {
            reads_fs: true,
            writes_fs: false,
            executes_process: false,
            network: false,
            destructive: false,
        }
    }

    pub const fn fs_write() -> Self {
        Self {
            reads_fs: true,
            writes_fs: true,
            executes_process: false,
            network: false,
            destructive: false,
        }
    }

    pub const fn process() -> Self {
        Self {
            reads_fs: true,
            writes_fs: true,
            executes_process: true,
            network: false,
            destructive: false,
        }
    }

    pub const fn network() -> Self {
        Self {
            reads_fs: false,
            writes_fs: false,
            executes_process: false,
            network: true,
            destructive: false,
        }
    }

    pub fn touches_fs(&self) -> bool {
        self.reads_fs || self.writes_fs
    }
}

/// Parameter value kinds accepted by the validator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
}

impl ParamKind {
    fn json_type(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

/// One declared parameter.
#[derive(Clone, Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
    /// Path parameters are canonicalized and containment-checked by the gate.
    pub is_path: bool,
}

impl ParamSpec {
    pub const fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
            is_path: false,
        }
    }

    pub const fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
            is_path: false,
        }
    }

    pub const fn path(mut self) -> Self {
        self.is_path = true;
        self
    }
}

/// Successful tool output plus observable side effects.
#[derive(Clone, Debug, Default)]
pub struct ToolOutput {
    pub output: String,
    pub modified_paths: Vec<PathBuf>,
    pub exit_code: Option<i32>,
}

impl ToolOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }
}

/// Handler-side failure. The orchestrator turns this into a failed
/// `ToolResult`; it never retries on its own.
#[derive(Clone, Debug)]
pub struct ToolFailure {
    pub message: String,
    pub retryable: bool,
}

impl ToolFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

impl<E: std::error::Error> From<E> for ToolFailure {
    fn from(e: E) -> Self {
        Self::new(e.to_string())
    }
}

/// Execution context handed to every handler.
#[derive(Clone, Debug)]
pub struct ExecContext {
    pub workdir: PathBuf,
    pub cancel: CancellationToken,
    pub deadline: Duration,
}

impl ExecContext {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            cancel: CancellationToken::new(),
            deadline: Duration::from_secs(120),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// The Tool trait - implement this to add a capability.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name (e.g. "read_file", "run_command").
    fn name(&self) -> &'static str;

    /// Human-readable description sent to the model.
    fn description(&self) -> &str;

    /// Declared parameters; drives both validation and the generated schema.
    fn params(&self) -> &[ParamSpec];

    /// Capability flags for the safety gate.
    fn capabilities(&self) -> Capabilities;

    /// Execute with validated arguments.
    async fn run(&self, args: &Value, ctx: &ExecContext) -> Result<ToolOutput, ToolFailure>;

    /// JSON schema generated from `params()`.
    fn input_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for p in self.params() {
            properties.insert(
                p.name.to_string(),
                json!({ "type": p.kind.json_type(), "description": p.description }),
            );
            if p.required {
                required.push(Value::String(p.name.to_string()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    fn to_llm_tool(&self) -> LlmTool {
        LlmTool {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// Builds the registry all-at-once at startup.
pub struct RegistryBuilder {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Panics on a duplicate name - names are unique and
    /// registration is a startup-time programmer action.
    pub fn register(mut self, tool: impl Tool + 'static) -> Self {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            panic!("duplicate tool registration: {}", name);
        }
        self
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

/// Immutable name → descriptor map, shared as `Arc<ToolRegistry>`.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Tool definitions for the LLM request.
    pub fn definitions(&self) -> Vec<LlmTool> {
        let mut defs: Vec<LlmTool> = self.tools.values().map(|t| t.to_llm_tool()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Validate arguments against the tool's declared parameters.
    ///
    /// Runs before the safety gate; a failure here never reaches the handler.
    pub fn validate(&self, name: &str, args: &Value) -> Result<(), String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| format!("unknown tool: {}", name))?;

        let obj = args
            .as_object()
            .ok_or_else(|| "arguments must be a JSON object".to_string())?;

        for p in tool.params() {
            match obj.get(p.name) {
                Some(v) if p.kind.matches(v) => {}
                Some(v) => {
                    return Err(format!(
                        "parameter '{}' expects {}, got {}",
                        p.name,
                        p.kind.json_type(),
                        json_type_name(v)
                    ))
                }
                None if p.required => {
                    return Err(format!("missing required parameter: {}", p.name))
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Values of path-declared parameters, for containment checks.
    pub fn path_arguments(&self, name: &str, args: &Value) -> Vec<String> {
        let Some(tool) = self.tools.get(name) else {
            return Vec::new();
        };
        tool.params()
            .iter()
            .filter(|p| p.is_path)
            .filter_map(|p| args.get(p.name).and_then(|v| v.as_str()))
            .map(String::from)
            .collect()
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the message back."
        }

        fn params(&self) -> &[ParamSpec] {
            const PARAMS: &[ParamSpec] = &[
                ParamSpec::required("message", ParamKind::String, "Text to echo"),
                ParamSpec::optional("repeat", ParamKind::Integer, "Repeat count"),
            ];
            PARAMS
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        async fn run(&self, args: &Value, _ctx: &ExecContext) -> Result<ToolOutput, ToolFailure> {
            let msg = args["message"].as_str().unwrap_or_default();
            Ok(ToolOutput::text(msg))
        }
    }

    fn registry() -> ToolRegistry {
        RegistryBuilder::new().register(EchoTool).build()
    }

    #[test]
    fn schema_generated_from_params() {
        let schema = EchoTool.input_schema();
        assert_eq!(schema["properties"]["message"]["type"], "string");
        assert_eq!(schema["required"][0], "message");
    }

    #[test]
    fn validate_accepts_good_args() {
        let r = registry();
        assert!(r
            .validate("echo", &json!({"message": "hi", "repeat": 2}))
            .is_ok());
        assert!(r.validate("echo", &json!({"message": "hi"})).is_ok());
    }

    #[test]
    fn validate_rejects_missing_required() {
        let r = registry();
        let err = r.validate("echo", &json!({})).unwrap_err();
        assert!(err.contains("message"));
    }

    #[test]
    fn validate_rejects_wrong_type() {
        let r = registry();
        let err = r.validate("echo", &json!({"message": 42})).unwrap_err();
        assert!(err.contains("expects string"));
    }

    #[test]
    fn validate_rejects_unknown_tool() {
        let r = registry();
        assert!(r.validate("nope", &json!({})).is_err());
    }

    #[test]
    #[should_panic(expected = "duplicate tool registration")]
    fn duplicate_registration_panics() {
        RegistryBuilder::new()
            .register(EchoTool)
            .register(EchoTool)
            .build();
    }
}
