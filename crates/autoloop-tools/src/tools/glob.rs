//! list_glob - fast file pattern matching

use crate::registry::{Capabilities, ExecContext, ParamKind, ParamSpec, Tool, ToolFailure, ToolOutput};
use globset::GlobBuilder;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const MAX_MATCHES: usize = 1000;

pub struct ListGlobTool {
    workspace_root: PathBuf,
}

impl ListGlobTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }
}

const PARAMS: &[ParamSpec] = &[
    ParamSpec::required(
        "pattern",
        ParamKind::String,
        "Glob pattern (e.g. '**/*.rs', 'src/**/*.ts')",
    ),
    ParamSpec::optional(
        "path",
        ParamKind::String,
        "Directory to search in (default: workspace root)",
    )
    .path(),
];

#[async_trait::async_trait]
impl Tool for ListGlobTool {
    fn name(&self) -> &'static str {
        "list_glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern. Supports ** for recursive matching. \
         Returns file paths sorted by modification time (newest first)."
    }

    fn params(&self) -> &[ParamSpec] {
        PARAMS
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::read_only()
    }

    async fn run(&self, args: &Value, _ctx: &ExecContext) -> Result<ToolOutput, ToolFailure> {
        let pattern = args["pattern"].as_str().unwrap_or_default();

        let search_root = args["path"]
            .as_str()
            .map(|p| {
                if Path::new(p).is_absolute() {
                    PathBuf::from(p)
                } else {
                    self.workspace_root.join(p)
                }
            })
            .unwrap_or_else(|| self.workspace_root.clone());

        let glob = GlobBuilder::new(pattern)
            .literal_separator(false)
            .build()
            .map_err(|e| ToolFailure::new(format!("invalid glob pattern: {}", e)))?
            .compile_matcher();

        let mut matches: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();

        for entry in WalkDir::new(&search_root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !name.starts_with('.') && name != "node_modules" && name != "target"
            })
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                let rel_path = entry.path().strip_prefix(&search_root).unwrap_or(entry.path());
                if glob.is_match(rel_path) {
                    let mtime = entry
                        .metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                    matches.push((entry.path().to_path_buf(), mtime));
                }
            }
        }

        matches.sort_by(|a, b| b.1.cmp(&a.1));

        debug!(pattern, matches = matches.len(), "list_glob");

        if matches.is_empty() {
            Ok(ToolOutput::text("No files found"))
        } else {
            let listing: Vec<String> = matches
                .iter()
                .take(MAX_MATCHES)
                .map(|(p, _)| p.to_string_lossy().to_string())
                .collect();
            Ok(ToolOutput::text(listing.join("\n")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn finds_matching_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/a.rs"), "").unwrap();
        std::fs::write(tmp.path().join("src/b.txt"), "").unwrap();

        let tool = ListGlobTool::new(tmp.path());
        let ctx = ExecContext::new(tmp.path());
        let out = tool
            .run(&json!({"pattern": "**/*.rs"}), &ctx)
            .await
            .unwrap();
        assert!(out.output.contains("a.rs"));
        assert!(!out.output.contains("b.txt"));
    }

    #[tokio::test]
    async fn invalid_pattern_is_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = ListGlobTool::new(tmp.path());
        let ctx = ExecContext::new(tmp.path());
        assert!(tool.run(&json!({"pattern": "{"}), &ctx).await.is_err());
    }
}
