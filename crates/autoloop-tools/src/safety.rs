//! Safety gate - the policy layer between "model wants to call tool T" and
//! "tool T runs"
//!
//! Classifies each invocation from capability flags plus a pattern scan over
//! string arguments, consults the approval policy matrix, enforces path
//! containment against the session working directory, and scrubs secrets
//! from captured output before it enters the context.

use crate::registry::{Capabilities, ToolRegistry};
use autoloop_core::{ApprovalPolicy, Error, ToolCall};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Patterns that mark a command string as destructive regardless of the
/// tool's own flags. The pattern set belongs to the gate, not the tool.
static DANGEROUS_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"rm\s+(-[a-zA-Z]*\s+)*(/|~)(\s|$)", "root-relative removal"),
        (r"rm\s+-[a-zA-Z]*r[a-zA-Z]*f|rm\s+-[a-zA-Z]*f[a-zA-Z]*r", "recursive force removal"),
        (r"mkfs(\.[a-z0-9]+)?\s", "filesystem format"),
        (r">\s*/dev/(sd[a-z]|nvme\d+|hd[a-z])", "raw device write"),
        (r"\bdd\s+[^|]*of=/dev/", "dd to device"),
        (r"sudo\s|doas\s", "privilege escalation"),
        (r"chmod\s+(-[a-zA-Z]+\s+)*777\s+/", "world-writable root chmod"),
        (r":\(\)\s*\{\s*:\|:&\s*\};:", "fork bomb"),
        (r"(curl|wget)\s+[^|;]*\|\s*(ba|z|da)?sh", "piped network to shell"),
        (r"\bshutdown\b|\breboot\b|\bhalt\b", "host power control"),
    ]
    .into_iter()
    .map(|(p, label)| (Regex::new(p).expect("dangerous pattern"), label))
    .collect()
});

/// Environment variable names stripped from process-executing tools.
static SECRET_ENV_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(_KEY|_TOKEN|_SECRET|_PASSWORD|_CREDENTIALS)$|^(AWS|GCP|AZURE)_")
        .expect("secret env pattern")
});

/// API-key-shaped substrings scrubbed from tool output.
static SECRET_OUTPUT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"sk-[A-Za-z0-9_-]{16,}",
        r"(?i)bearer\s+[A-Za-z0-9._~+/-]{16,}=*",
        r"(?i)(api[_-]?key|access[_-]?token|secret)\s*[:=]\s*['\x22]?[A-Za-z0-9._/+-]{12,}",
        r"gh[pousr]_[A-Za-z0-9]{16,}",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("secret output pattern"))
    .collect()
});

const REDACTED: &str = "[redacted]";

/// How an admitted-or-not decision came out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Deny(String),
    Ask(String),
}

/// Call classification for the policy matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallClass {
    PureRead,
    WriteEdit,
    DestructiveExec,
    Network,
}

/// Asked when the matrix says "ask". Absent handler means deny.
#[async_trait::async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn confirm(&self, tool: &str, summary: &str) -> bool;
}

#[derive(Clone, Debug, Default)]
pub struct SafetyGateConfig {
    /// Extra roots a path may resolve into besides the working directory.
    pub allowed_roots: Vec<PathBuf>,
    /// Known secret values (e.g. the API key) scrubbed from output verbatim.
    pub secret_values: Vec<String>,
}

pub struct SafetyGate {
    policy: ApprovalPolicy,
    workdir: PathBuf,
    config: SafetyGateConfig,
    approval: Option<Arc<dyn ApprovalHandler>>,
    /// Set after the first network-tool failure; `on-failure` asks from then on.
    network_failure_seen: AtomicBool,
}

impl SafetyGate {
    pub fn new(policy: ApprovalPolicy, workdir: impl Into<PathBuf>) -> Self {
        Self {
            policy,
            workdir: workdir.into(),
            config: SafetyGateConfig::default(),
            approval: None,
            network_failure_seen: AtomicBool::new(false),
        }
    }

    pub fn with_config(mut self, config: SafetyGateConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_approval(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval = Some(handler);
        self
    }

    pub fn policy(&self) -> ApprovalPolicy {
        self.policy
    }

    /// Classify a call from its capability flags and a scan of its string
    /// arguments. A dangerous-pattern hit upgrades the class to
    /// destructive/exec and is reported back for error attribution.
    pub fn classify(&self, call: &ToolCall, caps: Capabilities) -> (CallClass, Option<&'static str>) {
        let pattern_hit = scan_arguments(&call.arguments);

        let class = if caps.destructive || caps.executes_process || pattern_hit.is_some() {
            CallClass::DestructiveExec
        } else if caps.network {
            CallClass::Network
        } else if caps.writes_fs {
            CallClass::WriteEdit
        } else {
            CallClass::PureRead
        };

        (class, pattern_hit)
    }

    /// Run the full admission pipeline. `Ok(())` means the handler may run.
    pub async fn admit(
        &self,
        registry: &ToolRegistry,
        call: &ToolCall,
        caps: Capabilities,
    ) -> Result<(), Error> {
        // Path containment happens before any policy decision.
        if caps.touches_fs() {
            for raw in registry.path_arguments(&call.name, &call.arguments) {
                self.check_containment(&raw)?;
            }
        }

        let (class, pattern) = self.classify(call, caps);

        match self.decide(class) {
            Decision::Admit => Ok(()),
            Decision::Deny(reason) => {
                warn!(tool = call.name, %reason, "call denied by policy");
                Err(self.rejection(call, pattern, reason))
            }
            Decision::Ask(summary) => match &self.approval {
                Some(handler) => {
                    if handler.confirm(&call.name, &summary).await {
                        debug!(tool = call.name, "call approved interactively");
                        Ok(())
                    } else {
                        Err(self.rejection(call, pattern, "declined by user".to_string()))
                    }
                }
                None => Err(self.rejection(
                    call,
                    pattern,
                    "approval required but no handler installed".to_string(),
                )),
            },
        }
    }

    /// The §4.3 decision matrix.
    pub fn decide(&self, class: CallClass) -> Decision {
        use ApprovalPolicy::*;
        use CallClass::*;

        match (self.policy, class) {
            (Never, _) => Decision::Deny("policy is 'never'".into()),
            (Yolo, _) => Decision::Admit,

            (Auto, DestructiveExec) => Decision::Ask("destructive or process-executing call".into()),
            (Auto, _) => Decision::Admit,

            (AutoEdit, DestructiveExec) => {
                Decision::Ask("destructive or process-executing call".into())
            }
            (AutoEdit, Network) => Decision::Ask("network call".into()),
            (AutoEdit, _) => Decision::Admit,

            (OnRequest, _) => Decision::Ask("policy asks for every call".into()),

            (OnFailure, Network) if self.network_failure_seen.load(Ordering::Relaxed) => {
                Decision::Ask("network call after prior failure".into())
            }
            (OnFailure, _) => Decision::Admit,
        }
    }

    /// Record a failed call so `on-failure` starts asking for network tools.
    pub fn note_failure(&self, caps: Capabilities) {
        if caps.network {
            self.network_failure_seen.store(true, Ordering::Relaxed);
        }
    }

    /// Canonicalize a path argument and verify it stays inside the working
    /// directory or an explicitly allowed root.
    pub fn check_containment(&self, raw: &str) -> Result<PathBuf, Error> {
        let candidate = if Path::new(raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            self.workdir.join(raw)
        };

        let resolved = canonicalize_lenient(&candidate);
        let workdir = canonicalize_lenient(&self.workdir);

        if resolved.starts_with(&workdir)
            || self
                .config
                .allowed_roots
                .iter()
                .any(|root| resolved.starts_with(canonicalize_lenient(root)))
        {
            Ok(resolved)
        } else {
            Err(Error::PathTraversal {
                path: raw.to_string(),
            })
        }
    }

    /// Replace secret-shaped substrings and configured secret values in
    /// captured output before it enters the context manager.
    pub fn scrub_secrets(&self, output: &str) -> String {
        let mut scrubbed = output.to_string();
        for pattern in SECRET_OUTPUT_PATTERNS.iter() {
            scrubbed = pattern.replace_all(&scrubbed, REDACTED).into_owned();
        }
        for value in &self.config.secret_values {
            if !value.is_empty() {
                scrubbed = scrubbed.replace(value.as_str(), REDACTED);
            }
        }
        scrubbed
    }

    /// Whether an environment variable should be stripped from a spawned
    /// process's environment.
    pub fn env_is_secret(name: &str) -> bool {
        SECRET_ENV_PATTERN.is_match(name)
    }

    fn rejection(&self, call: &ToolCall, pattern: Option<&'static str>, reason: String) -> Error {
        match pattern {
            Some(p) => Error::DangerousCommand {
                pattern: p.to_string(),
            },
            None => Error::ApprovalDenied {
                tool: call.name.clone(),
                reason,
            },
        }
    }
}

/// Canonicalize through the deepest existing ancestor so containment checks
/// work for paths whose leaf does not exist yet.
fn canonicalize_lenient(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    let mut tail = Vec::new();
    let mut cursor = path;
    while let Some(parent) = cursor.parent() {
        if let Ok(resolved) = parent.canonicalize() {
            let mut out = resolved;
            if let Some(name) = cursor.file_name() {
                tail.push(name.to_os_string());
            }
            for part in tail.iter().rev() {
                out.push(part);
            }
            return out;
        }
        if let Some(name) = cursor.file_name() {
            tail.push(name.to_os_string());
        }
        cursor = parent;
    }
    path.to_path_buf()
}

/// Scan every string leaf of the argument object for dangerous patterns.
fn scan_arguments(args: &serde_json::Value) -> Option<&'static str> {
    match args {
        serde_json::Value::String(s) => DANGEROUS_PATTERNS
            .iter()
            .find(|(re, _)| re.is_match(s))
            .map(|(_, label)| *label),
        serde_json::Value::Array(items) => items.iter().find_map(scan_arguments),
        serde_json::Value::Object(map) => map.values().find_map(scan_arguments),
        _ => None,
    }
}
