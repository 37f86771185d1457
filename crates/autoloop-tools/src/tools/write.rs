//! write_file - create or overwrite a file

use crate::registry::{Capabilities, ExecContext, ParamKind, ParamSpec, Tool, ToolFailure, ToolOutput};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub struct WriteFileTool {
    workspace_root: PathBuf,
}

impl WriteFileTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }
}

const PARAMS: &[ParamSpec] = &[
    ParamSpec::required("file_path", ParamKind::String, "Path to the file to write").path(),
    ParamSpec::required("content", ParamKind::String, "Content to write to the file"),
];

#[async_trait::async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates parent directories if needed. \
         Overwrites the file if it exists. Prefer edit_file for modifications."
    }

    fn params(&self) -> &[ParamSpec] {
        PARAMS
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::fs_write()
    }

    async fn run(&self, args: &Value, _ctx: &ExecContext) -> Result<ToolOutput, ToolFailure> {
        let path = args["file_path"].as_str().unwrap_or_default();
        let content = args["content"].as_str().unwrap_or_default();

        let full_path = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.workspace_root.join(path)
        };

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolFailure::new(format!("failed to create directories: {}", e)))?;
        }

        fs::write(&full_path, content)
            .await
            .map_err(|e| ToolFailure::new(format!("failed to write {}: {}", path, e)))?;

        debug!(path, bytes = content.len(), "write_file");
        Ok(ToolOutput {
            output: format!("Wrote {} bytes to {}", content.len(), path),
            modified_paths: vec![full_path],
            exit_code: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn writes_and_reports_modified_path() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = WriteFileTool::new(tmp.path());
        let ctx = ExecContext::new(tmp.path());

        let out = tool
            .run(&json!({"file_path": "sub/new.txt", "content": "hello"}), &ctx)
            .await
            .unwrap();

        assert_eq!(out.modified_paths.len(), 1);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("sub/new.txt")).unwrap(),
            "hello"
        );
    }
}
