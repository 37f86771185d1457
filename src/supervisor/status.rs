//! Supervisor status snapshot (status.json)
//!
//! Replaced atomically after every iteration; the schema is a stable
//! external contract for dashboards and operators.

use crate::supervisor::circuit::{CircuitBreaker, CircuitState};
use autoloop_core::Result;
use autoloop_engine::store::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: RunState,
    pub iteration: u64,
    pub timestamp: DateTime<Utc>,
    pub circuit_breaker: CircuitStatus,
    pub rate_limit: RateStatus,
    pub halt_reason: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Halted,
    Idle,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub no_progress_count: u32,
    pub consecutive_errors: u32,
    pub permission_denials: u32,
    /// Additive field; not part of the documented minimum schema.
    #[serde(default)]
    pub completion_signals: u32,
}

impl CircuitStatus {
    pub fn from_breaker(breaker: &CircuitBreaker) -> Self {
        let counters = breaker.counters();
        Self {
            state: breaker.state(),
            no_progress_count: counters.no_progress,
            consecutive_errors: counters.consecutive_errors,
            permission_denials: counters.permission_denials,
            completion_signals: counters.completion_signals,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateStatus {
    pub calls_remaining: u32,
    pub max_calls: u32,
}

impl StatusSnapshot {
    pub fn running(iteration: u64, circuit: CircuitStatus, rate: RateStatus) -> Self {
        Self {
            state: RunState::Running,
            iteration,
            timestamp: Utc::now(),
            circuit_breaker: circuit,
            rate_limit: rate,
            halt_reason: None,
        }
    }

    pub fn halted(
        iteration: u64,
        circuit: CircuitStatus,
        rate: RateStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            state: RunState::Halted,
            iteration,
            timestamp: Utc::now(),
            circuit_breaker: circuit,
            rate_limit: rate,
            halt_reason: Some(reason.into()),
        }
    }
}

/// Write the snapshot, replacing the previous one atomically.
pub async fn write_status(path: &Path, snapshot: &StatusSnapshot) -> Result<()> {
    write_atomic(path, serde_json::to_vec_pretty(snapshot)?.as_slice()).await
}

pub async fn read_status(path: &Path) -> Result<StatusSnapshot> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StatusSnapshot {
        StatusSnapshot::halted(
            7,
            CircuitStatus {
                state: CircuitState::Open,
                no_progress_count: 3,
                consecutive_errors: 0,
                permission_denials: 0,
                completion_signals: 0,
            },
            RateStatus {
                calls_remaining: 93,
                max_calls: 100,
            },
            "circuit_open",
        )
    }

    #[tokio::test]
    async fn write_read_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("status.json");
        write_status(&path, &sample()).await.unwrap();

        let loaded = read_status(&path).await.unwrap();
        assert_eq!(loaded.state, RunState::Halted);
        assert_eq!(loaded.iteration, 7);
        assert_eq!(loaded.halt_reason.as_deref(), Some("circuit_open"));
        assert_eq!(loaded.circuit_breaker.state, CircuitState::Open);
    }

    #[test]
    fn schema_field_names_are_stable() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["state"], "halted");
        assert!(json["circuit_breaker"]["no_progress_count"].is_number());
        assert!(json["rate_limit"]["calls_remaining"].is_number());
        assert_eq!(json["circuit_breaker"]["state"], "open");
    }

    #[tokio::test]
    async fn snapshot_replaces_previous() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("status.json");
        write_status(&path, &sample()).await.unwrap();
        let running = StatusSnapshot::running(
            8,
            CircuitStatus {
                state: CircuitState::Closed,
                no_progress_count: 0,
                consecutive_errors: 0,
                permission_denials: 0,
                completion_signals: 0,
            },
            RateStatus {
                calls_remaining: 92,
                max_calls: 100,
            },
        );
        write_status(&path, &running).await.unwrap();
        let loaded = read_status(&path).await.unwrap();
        assert_eq!(loaded.state, RunState::Running);
        assert_eq!(loaded.iteration, 8);
        assert!(loaded.halt_reason.is_none());
    }
}
