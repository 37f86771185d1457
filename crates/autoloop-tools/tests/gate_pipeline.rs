//! Registry + safety gate working together, the way the orchestrator
//! drives them

use autoloop_core::{ApprovalPolicy, ToolCall};
use autoloop_tools::{default_registry, ApprovalHandler, SafetyGate};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn call(name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall {
        id: "tc-1".into(),
        name: name.into(),
        arguments: args,
    }
}

struct CountingApprover {
    approve: bool,
    asked: AtomicUsize,
}

#[async_trait::async_trait]
impl ApprovalHandler for CountingApprover {
    async fn confirm(&self, _tool: &str, _summary: &str) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.approve
    }
}

#[tokio::test]
async fn default_registry_has_expected_tools() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = default_registry(tmp.path());
    assert_eq!(
        registry.list(),
        vec![
            "edit_file",
            "list_glob",
            "read_file",
            "run_command",
            "search_grep",
            "write_file"
        ]
    );
    // Definitions carry generated schemas.
    let defs = registry.definitions();
    assert_eq!(defs.len(), 6);
    assert!(defs.iter().all(|d| d.input_schema["type"] == "object"));
}

#[tokio::test]
async fn gate_admits_reads_and_consults_handler_for_exec() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = default_registry(tmp.path());
    let approver = Arc::new(CountingApprover {
        approve: true,
        asked: AtomicUsize::new(0),
    });
    let gate =
        SafetyGate::new(ApprovalPolicy::Auto, tmp.path()).with_approval(approver.clone());

    let read = call("read_file", json!({"file_path": "a.txt"}));
    let read_caps = registry.get("read_file").unwrap().capabilities();
    gate.admit(&registry, &read, read_caps).await.unwrap();
    assert_eq!(approver.asked.load(Ordering::SeqCst), 0);

    let exec = call("run_command", json!({"command": "echo hi"}));
    let exec_caps = registry.get("run_command").unwrap().capabilities();
    gate.admit(&registry, &exec, exec_caps).await.unwrap();
    assert_eq!(approver.asked.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn declined_approval_becomes_denial() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = default_registry(tmp.path());
    let gate = SafetyGate::new(ApprovalPolicy::Auto, tmp.path()).with_approval(Arc::new(
        CountingApprover {
            approve: false,
            asked: AtomicUsize::new(0),
        },
    ));

    let exec = call("run_command", json!({"command": "cargo test"}));
    let caps = registry.get("run_command").unwrap().capabilities();
    let err = gate.admit(&registry, &exec, caps).await.unwrap_err();
    assert_eq!(err.code(), "approval_denied");
}

#[tokio::test]
async fn path_escape_denied_before_policy() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = default_registry(tmp.path());
    // Even yolo cannot escape the workspace.
    let gate = SafetyGate::new(ApprovalPolicy::Yolo, tmp.path());

    let sneaky = call("read_file", json!({"file_path": "../../etc/passwd"}));
    let caps = registry.get("read_file").unwrap().capabilities();
    let err = gate.admit(&registry, &sneaky, caps).await.unwrap_err();
    assert_eq!(err.code(), "path_traversal");
}

#[tokio::test]
async fn validation_rejects_before_gate_sees_the_call() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = default_registry(tmp.path());
    let err = registry
        .validate("edit_file", &json!({"file_path": "a.txt", "old_string": "x"}))
        .unwrap_err();
    assert!(err.contains("new_string"));
}
