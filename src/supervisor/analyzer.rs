//! Response analyzer - parses final assistant text for completion
//! indicators, the structured exit-signal block, errors, and denials
//!
//! Pure: the same input text always yields the same analysis.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

const MAX_COMPLETION_INDICATORS: usize = 10;
const MAX_MODIFIED_FILES: usize = 100;

static FENCED_JSON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced json pattern")
});

static ERROR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\berror\b",
        r"(?i)\bfailed\b",
        r"(?i)\bexception\b",
        r"(?i)\bpanicked\b",
        r"(?i)traceback \(most recent call last\)",
        r"(?i)\bfatal\b",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("error pattern"))
    .collect()
});

static EXIT_SIGNAL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"EXIT_SIGNAL:\s*true", r"\[EXIT\]"]
        .into_iter()
        .map(|p| Regex::new(p).expect("exit signal pattern"))
        .collect()
});

static DENIAL_PHRASES: &[&str] = &[
    "permission denied",
    "approval denied",
    "approval required",
    "not permitted to",
    "declined by user",
    "i don't have permission",
];

static COMPLETION_TOKENS: &[&str] = &["[DONE]", "[COMPLETE]", "task complete", "all tasks complete"];

static SESSION_ID_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)session[_ -]?id[:=]\s*([0-9a-fA-F][0-9a-fA-F-]{7,})").expect("session id pattern")
});

static PATH_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[\w][\w./-]*\.(?:rs|py|ts|tsx|js|go|java|c|h|cpp|toml|yaml|yml|json|md|txt|sh|cfg|ini)\b")
        .expect("path hint pattern")
});

/// The structured block the model is instructed to emit.
#[derive(Debug, Default, Deserialize)]
struct StatusBlock {
    #[serde(default)]
    exit_signal: bool,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    summary: Option<String>,
    #[serde(default)]
    files_modified: Vec<String>,
    #[serde(default)]
    errors: Vec<String>,
}

/// What one assistant response amounted to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseAnalysis {
    pub parsed_json: bool,
    pub exit_signal: bool,
    pub completion_indicators: usize,
    pub has_errors: bool,
    pub permission_denied: bool,
    pub session_id_hint: Option<String>,
    pub modified_files: Vec<String>,
    pub output_length: usize,
    pub status: Option<String>,
}

/// Analyze the final assistant text of a turn.
pub fn analyze(text: &str) -> ResponseAnalysis {
    let mut analysis = ResponseAnalysis {
        output_length: text.chars().count(),
        ..Default::default()
    };

    if text.is_empty() {
        return analysis;
    }

    // 1. Structured parse first. The first well-formed fenced JSON object
    // with a recognizable key is authoritative.
    let mut free_text = text.to_string();
    for capture in FENCED_JSON.captures_iter(text) {
        let raw = &capture[1];
        let looks_like_status = raw.contains("exit_signal") || raw.contains("\"status\"");
        if !looks_like_status {
            continue;
        }
        if let Ok(block) = serde_json::from_str::<StatusBlock>(raw) {
            analysis.parsed_json = true;
            analysis.exit_signal = block.exit_signal;
            analysis.status = block.status;
            analysis.has_errors = !block.errors.is_empty();
            analysis.modified_files = block.files_modified;
            // Mask the block so its string values don't feed the free-text
            // scans below.
            free_text = free_text.replace(&capture[0], "");
            break;
        }
    }

    // 2. Two-stage error scan over the remaining text.
    if !analysis.has_errors {
        analysis.has_errors = ERROR_PATTERNS.iter().any(|re| re.is_match(&free_text));
    }

    // 3. Completion indicators, capped.
    let mut indicators = 0usize;
    for token in COMPLETION_TOKENS {
        if token.chars().any(|c| c.is_lowercase()) {
            indicators += free_text.to_lowercase().matches(&token.to_lowercase()).count();
        } else {
            indicators += free_text.matches(token).count();
        }
    }
    analysis.completion_indicators = indicators.min(MAX_COMPLETION_INDICATORS);

    // 4. Exit signal: structured block or free-text markers.
    if !analysis.exit_signal {
        analysis.exit_signal = EXIT_SIGNAL_PATTERNS.iter().any(|re| re.is_match(&free_text));
    }

    // 5. Permission denial.
    let lower = free_text.to_lowercase();
    analysis.permission_denied = DENIAL_PHRASES.iter().any(|p| lower.contains(p));

    // 6. Session-id hint.
    analysis.session_id_hint = SESSION_ID_HINT
        .captures(&free_text)
        .map(|c| c[1].to_string());

    // 7. Modified files: structured union free-text inferred, newest kept.
    for m in PATH_HINT.find_iter(&free_text) {
        let path = m.as_str().to_string();
        if !analysis.modified_files.contains(&path) {
            analysis.modified_files.push(path);
        }
    }
    if analysis.modified_files.len() > MAX_MODIFIED_FILES {
        let excess = analysis.modified_files.len() - MAX_MODIFIED_FILES;
        analysis.modified_files.drain(0..excess);
    }

    analysis
}
