//! search_grep - content search with regex support

use crate::registry::{Capabilities, ExecContext, ParamKind, ParamSpec, Tool, ToolFailure, ToolOutput};
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const MAX_RESULT_LINES: usize = 500;

pub struct SearchGrepTool {
    workspace_root: PathBuf,
}

impl SearchGrepTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }
}

const PARAMS: &[ParamSpec] = &[
    ParamSpec::required("pattern", ParamKind::String, "Regex pattern to search for"),
    ParamSpec::optional(
        "path",
        ParamKind::String,
        "File or directory to search (default: workspace root)",
    )
    .path(),
    ParamSpec::optional(
        "glob",
        ParamKind::String,
        "Glob pattern to filter files (e.g. '*.rs')",
    ),
    ParamSpec::optional(
        "content_mode",
        ParamKind::Boolean,
        "Return matching lines instead of file paths",
    ),
    ParamSpec::optional(
        "case_insensitive",
        ParamKind::Boolean,
        "Case insensitive search (default: false)",
    ),
];

#[async_trait::async_trait]
impl Tool for SearchGrepTool {
    fn name(&self) -> &'static str {
        "search_grep"
    }

    fn description(&self) -> &str {
        "Search file contents using regex patterns. Returns matching file paths by \
         default, or matching lines with content_mode. Use glob to filter files."
    }

    fn params(&self) -> &[ParamSpec] {
        PARAMS
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::read_only()
    }

    async fn run(&self, args: &Value, _ctx: &ExecContext) -> Result<ToolOutput, ToolFailure> {
        let pattern_str = args["pattern"].as_str().unwrap_or_default();
        let case_insensitive = args["case_insensitive"].as_bool().unwrap_or(false);
        let content_mode = args["content_mode"].as_bool().unwrap_or(false);

        let regex_pattern = if case_insensitive {
            format!("(?i){}", pattern_str)
        } else {
            pattern_str.to_string()
        };
        let regex = Regex::new(&regex_pattern)
            .map_err(|e| ToolFailure::new(format!("invalid regex: {}", e)))?;

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

        let file_glob = args["glob"].as_str().and_then(|g| {
            globset::GlobBuilder::new(g)
                .literal_separator(false)
                .build()
                .ok()
                .map(|g| g.compile_matcher())
        });

        let mut lines_out: Vec<String> = Vec::new();
        let mut files_out: Vec<String> = Vec::new();

        for entry in WalkDir::new(&search_root)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !name.starts_with('.') && name != "node_modules" && name != "target"
            })
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(ref glob) = file_glob {
                let file_name = entry.file_name().to_string_lossy();
                if !glob.is_match(file_name.as_ref()) {
                    continue;
                }
            }

            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue; // skip binary/unreadable files
            };

            let mut matched = false;
            for (i, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matched = true;
                    if content_mode {
                        lines_out.push(format!(
                            "{}:{}:{}",
                            entry.path().display(),
                            i + 1,
                            line
                        ));
                        if lines_out.len() >= MAX_RESULT_LINES {
                            break;
                        }
                    } else {
                        break;
                    }
                }
            }
            if matched && !content_mode {
                files_out.push(entry.path().to_string_lossy().to_string());
            }
            if lines_out.len() >= MAX_RESULT_LINES {
                break;
            }
        }

        let result = if content_mode { lines_out } else { files_out };
        debug!(pattern = pattern_str, results = result.len(), "search_grep");

        if result.is_empty() {
            Ok(ToolOutput::text("No matches found"))
        } else {
            Ok(ToolOutput::text(result.join("\n")))
        }
    }
}
