//! Per-iteration records under the session's iterations/ directory

use crate::supervisor::analyzer::ResponseAnalysis;
use crate::supervisor::circuit::CircuitState;
use autoloop_core::Result;
use autoloop_engine::store::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoopIteration {
    pub ordinal: u64,
    pub timestamp: DateTime<Utc>,
    pub exit_signal: bool,
    pub completion_indicators: usize,
    pub has_errors: bool,
    pub permission_denied: bool,
    pub output_length: usize,
    pub status: Option<String>,
    pub files_modified: Vec<String>,
    pub circuit_state_after: CircuitState,
    pub calls_remaining_after: u32,
    pub error: Option<String>,
}

impl LoopIteration {
    pub fn new(
        ordinal: u64,
        analysis: &ResponseAnalysis,
        circuit_state_after: CircuitState,
        calls_remaining_after: u32,
        error: Option<String>,
    ) -> Self {
        Self {
            ordinal,
            timestamp: Utc::now(),
            exit_signal: analysis.exit_signal,
            completion_indicators: analysis.completion_indicators,
            has_errors: analysis.has_errors,
            permission_denied: analysis.permission_denied,
            output_length: analysis.output_length,
            status: analysis.status.clone(),
            files_modified: analysis.modified_files.clone(),
            circuit_state_after,
            calls_remaining_after,
            error,
        }
    }
}

/// Append the record as `iterations/<ordinal>.json`.
pub async fn append(iterations_dir: &Path, record: &LoopIteration) -> Result<()> {
    let path = iterations_dir.join(format!("{:05}.json", record.ordinal));
    write_atomic(&path, serde_json::to_vec_pretty(record)?.as_slice()).await
}

/// Read all iteration records in ordinal order.
pub async fn read_all(iterations_dir: &Path) -> Result<Vec<LoopIteration>> {
    let mut records = Vec::new();
    if !iterations_dir.exists() {
        return Ok(records);
    }
    let mut dir = tokio::fs::read_dir(iterations_dir).await?;
    while let Some(entry) = dir.next_entry().await? {
        if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = tokio::fs::read(entry.path()).await?;
        if let Ok(record) = serde_json::from_slice::<LoopIteration>(&bytes) {
            records.push(record);
        }
    }
    records.sort_by_key(|r| r.ordinal);
    Ok(records)
}
