//! run_command - execute shell commands with deadline, cancellation, and a
//! sanitized environment

use crate::registry::{Capabilities, ExecContext, ParamKind, ParamSpec, Tool, ToolFailure, ToolOutput};
use crate::safety::SafetyGate;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

const MAX_OUTPUT_CHARS: usize = 30_000;

pub struct RunCommandTool {
    workspace_root: PathBuf,
}

impl RunCommandTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }
}

const PARAMS: &[ParamSpec] = &[
    ParamSpec::required("command", ParamKind::String, "The shell command to execute"),
    ParamSpec::optional(
        "timeout",
        ParamKind::Integer,
        "Timeout in seconds (capped by the per-call deadline)",
    ),
    ParamSpec::optional(
        "description",
        ParamKind::String,
        "Short description of what this command does",
    ),
];

#[async_trait::async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &'static str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the session working directory. Captures stdout \
         and stderr. Secret-bearing environment variables are stripped."
    }

    fn params(&self) -> &[ParamSpec] {
        PARAMS
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            destructive: false,
            ..Capabilities::process()
        }
    }

    async fn run(&self, args: &Value, ctx: &ExecContext) -> Result<ToolOutput, ToolFailure> {
        let command = args["command"].as_str().unwrap_or_default();
        let timeout = args["timeout"]
            .as_u64()
            .map(std::time::Duration::from_secs)
            .unwrap_or(ctx.deadline)
            .min(ctx.deadline);

        if let Some(desc) = args["description"].as_str() {
            debug!(desc, "run_command: {}", command);
        } else {
            debug!("run_command: {}", &command[..command.len().min(80)]);
        }

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workspace_root)
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Strip secret-bearing variables from the child environment.
        for (name, _) in std::env::vars() {
            if SafetyGate::env_is_secret(&name) {
                cmd.env_remove(&name);
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ToolFailure::new(format!("failed to spawn: {}", e)))?;

        tokio::select! {
            result = tokio::time::timeout(timeout, child.wait()) => {
                match result {
                    Ok(Ok(status)) => {
                        let stdout = read_pipe(child.stdout.take()).await;
                        let stderr = read_pipe(child.stderr.take()).await;
                        Ok(format_output(status.code(), &stdout, &stderr))
                    }
                    Ok(Err(e)) => Err(ToolFailure::new(format!("failed to wait: {}", e))),
                    Err(_) => {
                        let _ = child.kill().await;
                        Err(ToolFailure::new(format!(
                            "command timed out after {}s",
                            timeout.as_secs()
                        )))
                    }
                }
            }
            _ = ctx.cancel.cancelled() => {
                let _ = child.kill().await;
                Ok(ToolOutput::text("[process killed by cancellation]"))
            }
        }
    }
}

async fn read_pipe(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    use tokio::io::AsyncReadExt;
    match pipe {
        Some(mut p) => {
            let mut buf = Vec::new();
            let _ = p.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).to_string()
        }
        None => String::new(),
    }
}

fn format_output(code: Option<i32>, stdout: &str, stderr: &str) -> ToolOutput {
    let exit_code = code.unwrap_or(-1);
    let body = if exit_code == 0 {
        if stderr.is_empty() {
            stdout.trim().to_string()
        } else {
            format!("{}\n{}", stdout.trim(), stderr.trim())
        }
    } else {
        format!("Exit code: {}\n{}\n{}", exit_code, stdout.trim(), stderr.trim())
    };

    let output = if body.is_empty() {
        "(no output)".to_string()
    } else if body.len() > MAX_OUTPUT_CHARS {
        let cut = body
            .char_indices()
            .take_while(|(i, _)| *i <= MAX_OUTPUT_CHARS)
            .last()
            .map(|(i, _)| i)
            .unwrap_or(0);
        format!("{}\n... [truncated, {} total chars]", &body[..cut], body.len())
    } else {
        body
    };

    ToolOutput {
        output,
        modified_paths: Vec::new(),
        exit_code: Some(exit_code),
    }
}
