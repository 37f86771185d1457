//! Tool orchestrator - validation, safety gating, bounded-concurrency
//! execution, and result recording
//!
//! Tool results land in the context in model-emission order even when calls
//! execute concurrently. Two calls are dependent when they share a written
//! path; dependent calls serialize in emission order.

use crate::context::ContextLog;
use crate::events::EventBus;
use autoloop_core::{Error, EventKind, Message, ToolCall, ToolResult};
use autoloop_tools::{ExecContext, SafetyGate, ToolRegistry};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Maximum concurrently-running calls within one round. 1 = serial.
    pub parallelism: usize,
    /// Per-call deadline. Zero means calls time out immediately.
    pub call_deadline: Duration,
    /// Approximate token cap applied to each result before it enters the
    /// context. The untruncated output still reaches event consumers once.
    pub max_result_tokens: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            call_deadline: Duration::from_secs(120),
            max_result_tokens: 2_500,
        }
    }
}

pub struct ToolOrchestrator {
    registry: Arc<ToolRegistry>,
    gate: Arc<SafetyGate>,
    config: OrchestratorConfig,
}

impl ToolOrchestrator {
    pub fn new(registry: Arc<ToolRegistry>, gate: Arc<SafetyGate>) -> Self {
        Self {
            registry,
            gate,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &Arc<SafetyGate> {
        &self.gate
    }

    /// Execute one round of tool calls and append each result to the context
    /// as a tool-role message keyed by call id. Returns results in
    /// model-emission order.
    pub async fn execute_round(
        &self,
        calls: &[ToolCall],
        ctx_log: &mut ContextLog,
        bus: &EventBus,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        let mut results: Vec<Option<ToolResult>> = (0..calls.len()).map(|_| None).collect();

        for wave in plan_waves(calls, &*self.registry, self.config.parallelism) {
            if wave.len() == 1 || self.config.parallelism <= 1 {
                for idx in wave {
                    results[idx] =
                        Some(self.execute_one(&calls[idx], bus, workdir, cancel).await);
                }
            } else {
                let semaphore = Arc::new(Semaphore::new(self.config.parallelism));
                let mut handles = Vec::with_capacity(wave.len());
                for idx in wave {
                    let call = calls[idx].clone();
                    let registry = self.registry.clone();
                    let gate = self.gate.clone();
                    let config = self.config.clone();
                    let workdir = workdir.to_path_buf();
                    let cancel = cancel.clone();
                    let bus = bus.clone();
                    let permit_source = semaphore.clone();
                    handles.push((
                        idx,
                        tokio::spawn(async move {
                            let _permit = permit_source.acquire().await;
                            execute_call(&registry, &gate, &config, &call, &workdir, &cancel, &bus)
                                .await
                        }),
                    ));
                }
                for (idx, handle) in handles {
                    results[idx] = Some(handle.await.unwrap_or_else(|e| {
                        ToolResult::failure(calls[idx].id.clone(), format!("task panicked: {}", e))
                    }));
                }
            }
        }

        let results: Vec<ToolResult> = results
            .into_iter()
            .map(|r| r.expect("every call produced a result"))
            .collect();

        // Append in emission order regardless of completion order.
        for result in &results {
            let mut message = Message::tool_result(result.call_id.clone(), result.content_string());
            // Tool pairing integrity relies on the call id, keep it verbatim.
            message.tool_call_id = Some(result.call_id.clone());
            ctx_log.append(message);
        }

        results
    }

    async fn execute_one(
        &self,
        call: &ToolCall,
        bus: &EventBus,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> ToolResult {
        execute_call(&self.registry, &self.gate, &self.config, call, workdir, cancel, bus).await
    }
}

async fn execute_call(
    registry: &ToolRegistry,
    gate: &SafetyGate,
    config: &OrchestratorConfig,
    call: &ToolCall,
    workdir: &Path,
    cancel: &CancellationToken,
    bus: &EventBus,
) -> ToolResult {
    bus.emit(EventKind::ToolCallStart {
        call_id: call.id.clone(),
        name: call.name.clone(),
    });

    let result = run_gated(registry, gate, config, call, workdir, cancel).await;

    bus.emit(EventKind::ToolCallComplete {
        call_id: call.id.clone(),
        name: call.name.clone(),
        ok: result.ok,
        output: result.output.clone(),
    });

    truncate_result(result, config.max_result_tokens)
}

async fn run_gated(
    registry: &ToolRegistry,
    gate: &SafetyGate,
    config: &OrchestratorConfig,
    call: &ToolCall,
    workdir: &Path,
    cancel: &CancellationToken,
) -> ToolResult {
    if cancel.is_cancelled() {
        return ToolResult::failure(call.id.clone(), "cancelled before execution");
    }

    // 1. Argument validation - a failure never reaches the handler.
    if let Err(message) = registry.validate(&call.name, &call.arguments) {
        debug!(tool = call.name, %message, "validation failed");
        let err = Error::Validation {
            tool: call.name.clone(),
            message,
        };
        return ToolResult::failure(call.id.clone(), err.to_string());
    }
    let tool = registry.get(&call.name).expect("validated tool exists");
    let caps = tool.capabilities();

    // 2. Safety gate.
    if let Err(err) = gate.admit(registry, call, caps).await {
        return ToolResult::failure(call.id.clone(), err.to_string());
    }

    // 3. Deadline zero short-circuits without invoking the handler.
    if config.call_deadline.is_zero() {
        let err = Error::ToolTimeout {
            tool: call.name.clone(),
            deadline_ms: 0,
        };
        return ToolResult::failure(call.id.clone(), err.to_string());
    }

    // 4. Run under deadline with a child cancellation scope.
    let child_cancel = cancel.child_token();
    let exec_ctx = ExecContext::new(workdir)
        .with_deadline(config.call_deadline)
        .with_cancel(child_cancel.clone());

    let outcome = tokio::time::timeout(config.call_deadline, tool.run(&call.arguments, &exec_ctx)).await;

    match outcome {
        Ok(Ok(output)) => {
            let scrubbed = gate.scrub_secrets(&output.output);
            let mut result = ToolResult::ok(call.id.clone(), scrubbed)
                .with_modified(output.modified_paths.clone());
            if let Some(code) = output.exit_code {
                result = result.with_exit_code(code);
            }
            result
        }
        Ok(Err(failure)) => {
            gate.note_failure(caps);
            warn!(tool = call.name, "tool failed: {}", failure.message);
            ToolResult::failure(call.id.clone(), gate.scrub_secrets(&failure.message))
                .retryable(failure.retryable)
        }
        Err(_) => {
            child_cancel.cancel();
            gate.note_failure(caps);
            let err = Error::ToolTimeout {
                tool: call.name.clone(),
                deadline_ms: config.call_deadline.as_millis() as u64,
            };
            ToolResult::failure(call.id.clone(), err.to_string())
        }
    }
}

/// Cut a result's context-facing output at the token cap. Output exactly at
/// the cap is preserved; one character over is truncated.
fn truncate_result(mut result: ToolResult, max_tokens: usize) -> ToolResult {
    let max_chars = max_tokens * 4;
    if result.output.len() > max_chars {
        let cut = result
            .output
            .char_indices()
            .take_while(|(i, _)| *i <= max_chars)
            .last()
            .map(|(i, _)| i)
            .unwrap_or(0);
        let total = result.output.len();
        result.output.truncate(cut);
        result
            .output
            .push_str(&format!("\n... [truncated, {} total chars]", total));
        result.truncated = true;
    }
    result
}

/// Partition call indices into waves: a call conflicts with an earlier call
/// in the same wave when both write and share a path argument, or when both
/// run the same process-executing tool.
fn plan_waves(calls: &[ToolCall], registry: &ToolRegistry, parallelism: usize) -> Vec<Vec<usize>> {
    if parallelism <= 1 {
        return calls.iter().enumerate().map(|(i, _)| vec![i]).collect();
    }

    let mut waves: Vec<Vec<usize>> = Vec::new();
    let mut wave: Vec<usize> = Vec::new();
    let mut wave_keys: HashSet<String> = HashSet::new();

    for (idx, call) in calls.iter().enumerate() {
        let keys = resource_keys(call, registry);
        let conflicts = keys.iter().any(|k| wave_keys.contains(k));
        if conflicts && !wave.is_empty() {
            waves.push(std::mem::take(&mut wave));
            wave_keys.clear();
        }
        wave.push(idx);
        wave_keys.extend(keys);
    }
    if !wave.is_empty() {
        waves.push(wave);
    }
    waves
}

fn resource_keys(call: &ToolCall, registry: &ToolRegistry) -> Vec<String> {
    let Some(tool) = registry.get(&call.name) else {
        return Vec::new();
    };
    let caps = tool.capabilities();
    let mut keys = Vec::new();
    if caps.writes_fs {
        for path in registry.path_arguments(&call.name, &call.arguments) {
            keys.push(format!("path:{}", path));
        }
    }
    if caps.executes_process {
        keys.push(format!("proc:{}", call.name));
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoloop_core::ApprovalPolicy;
    use autoloop_core::SessionId;
    use serde_json::json;

    fn setup(tmp: &Path) -> (ToolOrchestrator, EventBus) {
        let registry = Arc::new(autoloop_tools::default_registry(tmp));
        let gate = Arc::new(SafetyGate::new(ApprovalPolicy::Auto, tmp));
        (
            ToolOrchestrator::new(registry, gate),
            EventBus::new(SessionId::new("s1")),
        )
    }

    fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }
    }

    #[tokio::test]
    async fn round_executes_and_appends_results() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f.txt"), "content").unwrap();
        let (orch, bus) = setup(tmp.path());
        let mut log = ContextLog::new(Default::default());

        let calls = vec![call("tc-1", "read_file", json!({"file_path": "f.txt"}))];
        let results = orch
            .execute_round(&calls, &mut log, &bus, tmp.path(), &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 1);
        assert!(results[0].ok);
        assert_eq!(log.len(), 1);
        assert_eq!(
            log.view()[0].message.tool_call_id.as_deref(),
            Some("tc-1")
        );
    }

    #[tokio::test]
    async fn invalid_arguments_become_synthetic_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let (orch, bus) = setup(tmp.path());
        let mut log = ContextLog::new(Default::default());

        let calls = vec![call("tc-1", "read_file", json!({}))];
        let results = orch
            .execute_round(&calls, &mut log, &bus, tmp.path(), &CancellationToken::new())
            .await;

        assert!(!results[0].ok);
        assert!(results[0].error.as_ref().unwrap().contains("file_path"));
    }

    #[tokio::test]
    async fn unknown_tool_is_synthetic_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (orch, bus) = setup(tmp.path());
        let mut log = ContextLog::new(Default::default());

        let calls = vec![call("tc-1", "teleport", json!({}))];
        let results = orch
            .execute_round(&calls, &mut log, &bus, tmp.path(), &CancellationToken::new())
            .await;
        assert!(!results[0].ok);
    }

    #[tokio::test]
    async fn denied_call_never_runs_handler() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(autoloop_tools::default_registry(tmp.path()));
        let gate = Arc::new(SafetyGate::new(ApprovalPolicy::Never, tmp.path()));
        let orch = ToolOrchestrator::new(registry, gate);
        let bus = EventBus::new(SessionId::new("s1"));
        let mut log = ContextLog::new(Default::default());

        let calls = vec![call(
            "tc-1",
            "write_file",
            json!({"file_path": "out.txt", "content": "x"}),
        )];
        let results = orch
            .execute_round(&calls, &mut log, &bus, tmp.path(), &CancellationToken::new())
            .await;

        assert!(!results[0].ok);
        assert!(!tmp.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn zero_deadline_times_out_without_invoking() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f.txt"), "content").unwrap();
        let registry = Arc::new(autoloop_tools::default_registry(tmp.path()));
        let gate = Arc::new(SafetyGate::new(ApprovalPolicy::Auto, tmp.path()));
        let orch = ToolOrchestrator::new(registry, gate).with_config(OrchestratorConfig {
            call_deadline: Duration::ZERO,
            ..Default::default()
        });
        let bus = EventBus::new(SessionId::new("s1"));
        let mut log = ContextLog::new(Default::default());

        let calls = vec![call("tc-1", "read_file", json!({"file_path": "f.txt"}))];
        let results = orch
            .execute_round(&calls, &mut log, &bus, tmp.path(), &CancellationToken::new())
            .await;

        assert!(!results[0].ok);
        assert!(results[0].error.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn results_keep_emission_order_under_parallelism() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "beta").unwrap();
        let registry = Arc::new(autoloop_tools::default_registry(tmp.path()));
        let gate = Arc::new(SafetyGate::new(ApprovalPolicy::Auto, tmp.path()));
        let orch = ToolOrchestrator::new(registry, gate).with_config(OrchestratorConfig {
            parallelism: 4,
            ..Default::default()
        });
        let bus = EventBus::new(SessionId::new("s1"));
        let mut log = ContextLog::new(Default::default());

        let calls = vec![
            call("tc-a", "read_file", json!({"file_path": "a.txt"})),
            call("tc-b", "read_file", json!({"file_path": "b.txt"})),
        ];
        let results = orch
            .execute_round(&calls, &mut log, &bus, tmp.path(), &CancellationToken::new())
            .await;

        assert_eq!(results[0].call_id, "tc-a");
        assert_eq!(results[1].call_id, "tc-b");
        assert!(results[0].output.contains("alpha"));
        assert!(results[1].output.contains("beta"));
    }

    #[tokio::test]
    async fn truncation_boundary_is_exact() {
        let at_limit = ToolResult::ok("tc", "x".repeat(40));
        let kept = truncate_result(at_limit, 10); // cap = 40 chars
        assert!(!kept.truncated);
        assert_eq!(kept.output.len(), 40);

        let over = ToolResult::ok("tc", "x".repeat(41));
        let cut = truncate_result(over, 10);
        assert!(cut.truncated);
        assert!(cut.output.contains("[truncated, 41 total chars]"));
    }

    #[test]
    fn waves_serialize_writes_to_same_path() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = autoloop_tools::default_registry(tmp.path());
        let calls = vec![
            call("1", "write_file", json!({"file_path": "same.txt", "content": "a"})),
            call("2", "write_file", json!({"file_path": "same.txt", "content": "b"})),
            call("3", "read_file", json!({"file_path": "other.txt"})),
        ];
        let waves = plan_waves(&calls, &registry, 4);
        // The two writes conflict; the read joins the second wave.
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0], vec![0]);
        assert_eq!(waves[1], vec![1, 2]);
    }

    #[test]
    fn serial_parallelism_yields_singleton_waves() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = autoloop_tools::default_registry(tmp.path());
        let calls = vec![
            call("1", "read_file", json!({"file_path": "a"})),
            call("2", "read_file", json!({"file_path": "b"})),
        ];
        let waves = plan_waves(&calls, &registry, 1);
        assert_eq!(waves.len(), 2);
    }
}
