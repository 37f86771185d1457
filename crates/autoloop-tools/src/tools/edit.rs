//! edit_file - find and replace exact strings in files

use crate::registry::{Capabilities, ExecContext, ParamKind, ParamSpec, Tool, ToolFailure, ToolOutput};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub struct EditFileTool {
    workspace_root: PathBuf,
}

impl EditFileTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }
}

const PARAMS: &[ParamSpec] = &[
    ParamSpec::required("file_path", ParamKind::String, "Path to the file to edit").path(),
    ParamSpec::required("old_string", ParamKind::String, "Exact text to find and replace"),
    ParamSpec::required("new_string", ParamKind::String, "Replacement text"),
    ParamSpec::optional(
        "replace_all",
        ParamKind::Boolean,
        "Replace every occurrence instead of requiring a unique match",
    ),
];

#[async_trait::async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &'static str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing an exact string match. The old_string must appear \
         exactly once in the file unless replace_all is set."
    }

    fn params(&self) -> &[ParamSpec] {
        PARAMS
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::fs_write()
    }

    async fn run(&self, args: &Value, _ctx: &ExecContext) -> Result<ToolOutput, ToolFailure> {
        let path = args["file_path"].as_str().unwrap_or_default();
        let old_string = args["old_string"].as_str().unwrap_or_default();
        let new_string = args["new_string"].as_str().unwrap_or_default();
        let replace_all = args["replace_all"].as_bool().unwrap_or(false);

        if old_string.is_empty() {
            return Err(ToolFailure::new("old_string must not be empty"));
        }
        if old_string == new_string {
            return Err(ToolFailure::new("old_string and new_string are identical"));
        }

        let full_path = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.workspace_root.join(path)
        };

        let content = fs::read_to_string(&full_path)
            .await
            .map_err(|e| ToolFailure::new(format!("failed to read {}: {}", path, e)))?;

        let occurrences = content.matches(old_string).count();
        let (updated, replaced) = match (occurrences, replace_all) {
            (0, _) => return Err(ToolFailure::new("old_string not found in file")),
            (1, _) => (content.replacen(old_string, new_string, 1), 1),
            (n, true) => (content.replace(old_string, new_string), n),
            (n, false) => {
                return Err(ToolFailure::new(format!(
                    "old_string appears {} times; pass replace_all or make it unique",
                    n
                )))
            }
        };

        fs::write(&full_path, &updated)
            .await
            .map_err(|e| ToolFailure::new(format!("failed to write {}: {}", path, e)))?;

        debug!(path, replaced, "edit_file");
        Ok(ToolOutput {
            output: format!("Replaced {} occurrence(s) in {}", replaced, path),
            modified_paths: vec![full_path],
            exit_code: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup(content: &str) -> (tempfile::TempDir, EditFileTool, ExecContext) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f.txt"), content).unwrap();
        let tool = EditFileTool::new(tmp.path());
        let ctx = ExecContext::new(tmp.path());
        (tmp, tool, ctx)
    }

    #[tokio::test]
    async fn replaces_unique_match() {
        let (tmp, tool, ctx) = setup("one two three");
        tool.run(
            &json!({"file_path": "f.txt", "old_string": "two", "new_string": "2"}),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("f.txt")).unwrap(),
            "one 2 three"
        );
    }

    #[tokio::test]
    async fn rejects_ambiguous_match_without_replace_all() {
        let (_tmp, tool, ctx) = setup("x x x");
        let err = tool
            .run(
                &json!({"file_path": "f.txt", "old_string": "x", "new_string": "y"}),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(err.message.contains("3 times"));
    }

    #[tokio::test]
    async fn replace_all_replaces_everything() {
        let (tmp, tool, ctx) = setup("x x x");
        tool.run(
            &json!({"file_path": "f.txt", "old_string": "x", "new_string": "y", "replace_all": true}),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("f.txt")).unwrap(),
            "y y y"
        );
    }

    #[tokio::test]
    async fn missing_old_string_is_failure() {
        let (_tmp, tool, ctx) = setup("abc");
        let err = tool
            .run(
                &json!({"file_path": "f.txt", "old_string": "zzz", "new_string": "y"}),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(err.message.contains("not found"));
    }
}
