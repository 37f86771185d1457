//! Autoloop tools — tool contract, registry, safety gate, builtin tools
//!
//! Each builtin tool is a self-contained file in src/tools/. The registry is
//! assembled all-at-once at startup and immutable afterwards; every call
//! passes argument validation and then the safety gate before a handler runs.

pub mod registry;
pub mod safety;
pub mod tools;

pub use registry::{
    Capabilities, ExecContext, ParamKind, ParamSpec, RegistryBuilder, Tool, ToolFailure,
    ToolOutput, ToolRegistry,
};
pub use safety::{ApprovalHandler, CallClass, Decision, SafetyGate, SafetyGateConfig};

use std::path::Path;

/// Build the default registry with all builtin tools rooted at `workspace`.
pub fn default_registry(workspace: impl AsRef<Path>) -> ToolRegistry {
    let root = workspace.as_ref();
    RegistryBuilder::new()
        .register(tools::read::ReadFileTool::new(root))
        .register(tools::glob::ListGlobTool::new(root))
        .register(tools::grep::SearchGrepTool::new(root))
        .register(tools::write::WriteFileTool::new(root))
        .register(tools::edit::EditFileTool::new(root))
        .register(tools::exec::RunCommandTool::new(root))
        .build()
}
