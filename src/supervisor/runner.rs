//! The autonomous loop: iterate turns until the dual-condition exit gate
//! fires or a guard (rate limiter, circuit breaker, denial count) halts it
//!
//! Each iteration: admit → tick → record → persist → decide. The session
//! snapshot is saved every iteration so a killed process resumes exactly
//! where the last completed iteration left off.

use crate::supervisor::analyzer::{self, ResponseAnalysis};
use crate::supervisor::circuit::{CircuitBreaker, CircuitState, TickInput};
use crate::supervisor::iteration::{self, LoopIteration};
use crate::supervisor::log::{self, RunLogRecord};
use crate::supervisor::rate_limit::RateLimiter;
use crate::supervisor::status::{self, CircuitStatus, RateStatus, StatusSnapshot};
use autoloop_core::{EventKind, Result, TurnEndReason};
use autoloop_engine::{FsSessionStore, Session, TurnEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why the loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaltReason {
    CompleteWithSignal,
    MaxLoops,
    CircuitOpen,
    RateLimited,
    PermissionDenied,
    Cancelled,
    Fatal,
}

impl HaltReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CompleteWithSignal => "complete_with_signal",
            Self::MaxLoops => "max_loops",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::PermissionDenied => "permission_denied",
            Self::Cancelled => "cancelled",
            Self::Fatal => "fatal",
        }
    }

    /// Process exit code of an autonomous run.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CompleteWithSignal => 0,
            Self::Fatal | Self::PermissionDenied => 1,
            Self::MaxLoops => 2,
            Self::CircuitOpen => 3,
            Self::RateLimited => 4,
            Self::Cancelled => 5,
        }
    }
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The durable instruction documents driving the loop.
#[derive(Clone, Debug, Default)]
pub struct PromptBundle {
    pub instructions: String,
    pub checklist: Option<String>,
    pub build_notes: Option<String>,
}

impl PromptBundle {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            checklist: None,
            build_notes: None,
        }
    }

    pub async fn load(
        instructions: &PathBuf,
        checklist: Option<&PathBuf>,
        build_notes: Option<&PathBuf>,
    ) -> Result<Self> {
        let mut bundle = Self::new(tokio::fs::read_to_string(instructions).await?);
        if let Some(path) = checklist {
            bundle.checklist = Some(tokio::fs::read_to_string(path).await?);
        }
        if let Some(path) = build_notes {
            bundle.build_notes = Some(tokio::fs::read_to_string(path).await?);
        }
        Ok(bundle)
    }

    /// Deterministic per-iteration prompt: same bundle + ordinal ⇒ same text.
    pub fn compose(&self, iteration: u64, max_iterations: u64) -> String {
        let mut prompt = String::new();
        prompt.push_str(&self.instructions);
        if let Some(checklist) = &self.checklist {
            prompt.push_str("\n\n## Checklist\n");
            prompt.push_str(checklist);
        }
        if let Some(build) = &self.build_notes {
            prompt.push_str("\n\n## Build & run\n");
            prompt.push_str(build);
        }
        prompt.push_str(&format!(
            "\n\nThis is iteration {} of at most {}. Continue from the current workspace \
             state. When every task is verifiably complete, emit at least two completion \
             markers (e.g. [DONE]) and a fenced JSON block with \"exit_signal\": true.",
            iteration, max_iterations
        ));
        prompt
    }
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub max_iterations: u64,
    /// Completion indicators required by the dual-condition exit gate.
    pub completion_indicators_required: usize,
    /// Cumulative permission denials that halt the run.
    pub permission_denial_halt: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            completion_indicators_required: 2,
            permission_denial_halt: 2,
        }
    }
}

pub struct AutonomousSupervisor {
    store: FsSessionStore,
    engine: TurnEngine,
    session: Arc<Session>,
    bundle: PromptBundle,
    circuit: CircuitBreaker,
    limiter: RateLimiter,
    config: SupervisorConfig,
    cancel: CancellationToken,
}

/// Outcome of a finished run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub reason: HaltReason,
    pub iterations: u64,
}

impl AutonomousSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: FsSessionStore,
        engine: TurnEngine,
        session: Arc<Session>,
        bundle: PromptBundle,
        circuit: CircuitBreaker,
        limiter: RateLimiter,
        config: SupervisorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            engine,
            session,
            bundle,
            circuit,
            limiter,
            config,
            cancel,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub fn circuit_mut(&mut self) -> &mut CircuitBreaker {
        &mut self.circuit
    }

    fn rate_status(&self) -> RateStatus {
        RateStatus {
            calls_remaining: self.limiter.calls_remaining(),
            max_calls: self.limiter.max_calls(),
        }
    }

    async fn write_running_status(&self, iteration: u64) -> Result<()> {
        let path = self
            .store
            .session_dir(&self.session.id)
            .join("status.json");
        status::write_status(
            &path,
            &StatusSnapshot::running(
                iteration,
                CircuitStatus::from_breaker(&self.circuit),
                self.rate_status(),
            ),
        )
        .await
    }

    async fn write_halted_status(&self, iteration: u64, reason: HaltReason) -> Result<()> {
        let path = self
            .store
            .session_dir(&self.session.id)
            .join("status.json");
        status::write_status(
            &path,
            &StatusSnapshot::halted(
                iteration,
                CircuitStatus::from_breaker(&self.circuit),
                self.rate_status(),
                reason.as_str(),
            ),
        )
        .await
    }

    /// Drive up to `max_iterations` turns. Always writes a final halted
    /// status snapshot and saves the session before returning.
    pub async fn run(mut self) -> Result<RunReport> {
        let mut iteration = 0u64;

        log::emit(RunLogRecord::SupervisorStarted {
            session_id: self.session.id.as_str(),
            max_iterations: self.config.max_iterations,
            calls_remaining: self.limiter.calls_remaining(),
        });

        let reason = loop {
            if iteration >= self.config.max_iterations {
                break HaltReason::MaxLoops;
            }
            iteration += 1;

            if self.cancel.is_cancelled() {
                iteration -= 1; // the cancelled iteration never ran
                break HaltReason::Cancelled;
            }
            if !self.limiter.admit().await? {
                iteration -= 1;
                break HaltReason::RateLimited;
            }
            if self.circuit.state() == CircuitState::Open {
                iteration -= 1;
                break HaltReason::CircuitOpen;
            }

            self.write_running_status(iteration).await?;
            log::emit(RunLogRecord::IterationStarted { iteration });

            let prompt = self
                .bundle
                .compose(iteration, self.config.max_iterations);
            let outcome = self
                .engine
                .run_turn(&self.session, &prompt, self.cancel.child_token())
                .await;

            let analysis = analyzer::analyze(&outcome.assistant_text);
            let state_before = self.circuit.state();
            let state_after = self.circuit.tick(tick_input(&analysis, &outcome));
            if state_after != state_before {
                self.session.bus().emit(EventKind::LoopStateChange {
                    state: state_after.to_string(),
                });
            }

            let record = LoopIteration::new(
                iteration,
                &analysis,
                state_after,
                self.limiter.calls_remaining(),
                outcome.error.as_ref().map(|e| e.message.clone()),
            );
            iteration::append(&self.store.iterations_dir(&self.session.id), &record).await?;
            self.store.save(&self.session).await?;

            log::emit(RunLogRecord::IterationCompleted {
                iteration,
                exit_signal: analysis.exit_signal,
                completion_indicators: analysis.completion_indicators,
                has_errors: analysis.has_errors,
                circuit: state_after,
            });

            if outcome.reason == TurnEndReason::Cancelled {
                break HaltReason::Cancelled;
            }
            if outcome.reason == TurnEndReason::Error {
                warn!("turn ended with fatal error, halting");
                break HaltReason::Fatal;
            }
            if dual_exit_condition(&analysis, self.config.completion_indicators_required) {
                break HaltReason::CompleteWithSignal;
            }
            if self.circuit.counters().permission_denials >= self.config.permission_denial_halt {
                break HaltReason::PermissionDenied;
            }
        };

        self.store.save(&self.session).await?;
        self.write_halted_status(iteration, reason).await?;
        log::emit(RunLogRecord::SupervisorHalted {
            reason: reason.as_str(),
            iterations: iteration,
        });
        info!(%reason, iteration, "autonomous run halted");

        Ok(RunReport { reason, iterations: iteration })
    }
}

/// The dual-condition exit gate: enough completion indicators AND the
/// explicit structured exit signal.
pub fn dual_exit_condition(analysis: &ResponseAnalysis, indicators_required: usize) -> bool {
    analysis.completion_indicators >= indicators_required && analysis.exit_signal
}

fn tick_input(
    analysis: &ResponseAnalysis,
    outcome: &autoloop_engine::TurnOutcome,
) -> TickInput {
    TickInput {
        files_changed: !analysis.modified_files.is_empty(),
        has_errors: analysis.has_errors || outcome.error.is_some(),
        has_completion_indicator: analysis.completion_indicators > 0,
        exit_signal: analysis.exit_signal,
        has_permission_denial: analysis.permission_denied,
        loop_detected: outcome.loop_detected,
        output_length: analysis.output_length,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(HaltReason::CompleteWithSignal.exit_code(), 0);
        assert_eq!(HaltReason::Fatal.exit_code(), 1);
        assert_eq!(HaltReason::MaxLoops.exit_code(), 2);
        assert_eq!(HaltReason::CircuitOpen.exit_code(), 3);
        assert_eq!(HaltReason::RateLimited.exit_code(), 4);
        assert_eq!(HaltReason::Cancelled.exit_code(), 5);
    }

    #[test]
    fn dual_gate_requires_both_conditions() {
        let mut analysis = ResponseAnalysis {
            completion_indicators: 2,
            exit_signal: true,
            ..Default::default()
        };
        assert!(dual_exit_condition(&analysis, 2));

        analysis.exit_signal = false;
        assert!(!dual_exit_condition(&analysis, 2));

        analysis.exit_signal = true;
        analysis.completion_indicators = 1;
        assert!(!dual_exit_condition(&analysis, 2));
    }

    #[test]
    fn prompt_composition_is_deterministic() {
        let bundle = PromptBundle {
            instructions: "Do the work.".into(),
            checklist: Some("- item one".into()),
            build_notes: None,
        };
        assert_eq!(bundle.compose(3, 10), bundle.compose(3, 10));
        assert!(bundle.compose(3, 10).contains("iteration 3 of at most 10"));
        assert!(bundle.compose(1, 10).contains("Checklist"));
    }
}
