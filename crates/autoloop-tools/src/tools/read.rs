//! read_file - read file contents with optional offset/limit

use crate::registry::{Capabilities, ExecContext, ParamKind, ParamSpec, Tool, ToolFailure, ToolOutput};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const DEFAULT_LIMIT: usize = 2000;

pub struct ReadFileTool {
    workspace_root: PathBuf,
}

impl ReadFileTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace_root.join(p)
        }
    }
}

const PARAMS: &[ParamSpec] = &[
    ParamSpec::required(
        "file_path",
        ParamKind::String,
        "Absolute or workspace-relative path to read",
    )
    .path(),
    ParamSpec::optional("offset", ParamKind::Integer, "Line number to start from (1-indexed)"),
    ParamSpec::optional(
        "limit",
        ParamKind::Integer,
        "Maximum number of lines to read (default 2000)",
    ),
];

#[async_trait::async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Returns numbered lines. Use offset/limit for large files."
    }

    fn params(&self) -> &[ParamSpec] {
        PARAMS
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::read_only()
    }

    async fn run(&self, args: &Value, _ctx: &ExecContext) -> Result<ToolOutput, ToolFailure> {
        let path = args["file_path"].as_str().unwrap_or_default();
        let resolved = self.resolve(path);

        let content = fs::read_to_string(&resolved)
            .await
            .map_err(|e| ToolFailure::new(format!("failed to read {}: {}", path, e)))?;

        let offset = args["offset"].as_u64().unwrap_or(1) as usize;
        let limit = args["limit"].as_u64().unwrap_or(DEFAULT_LIMIT as u64) as usize;

        let lines: Vec<&str> = content.lines().collect();
        let start = offset.saturating_sub(1).min(lines.len());
        let end = (start + limit).min(lines.len());

        // Number lines like cat -n
        let numbered: Vec<String> = lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>6}\t{}", start + i + 1, line))
            .collect();

        debug!(path, lines = end - start, offset, "read_file");
        Ok(ToolOutput::text(numbered.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn reads_and_numbers_lines() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f.txt"), "alpha\nbeta\ngamma").unwrap();

        let tool = ReadFileTool::new(tmp.path());
        let ctx = ExecContext::new(tmp.path());
        let out = tool
            .run(&json!({"file_path": "f.txt"}), &ctx)
            .await
            .unwrap();
        assert!(out.output.contains("1\talpha"));
        assert!(out.output.contains("3\tgamma"));
    }

    #[tokio::test]
    async fn respects_offset_and_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let body: String = (1..=10).map(|i| format!("line{}\n", i)).collect();
        std::fs::write(tmp.path().join("f.txt"), body).unwrap();

        let tool = ReadFileTool::new(tmp.path());
        let ctx = ExecContext::new(tmp.path());
        let out = tool
            .run(&json!({"file_path": "f.txt", "offset": 4, "limit": 2}), &ctx)
            .await
            .unwrap();
        assert!(out.output.contains("line4"));
        assert!(out.output.contains("line5"));
        assert!(!out.output.contains("line6"));
    }

    #[tokio::test]
    async fn missing_file_is_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = ReadFileTool::new(tmp.path());
        let ctx = ExecContext::new(tmp.path());
        let err = tool
            .run(&json!({"file_path": "nope.txt"}), &ctx)
            .await
            .unwrap_err();
        assert!(err.message.contains("failed to read"));
    }
}
