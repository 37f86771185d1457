//! Circuit breaker over autonomous-loop health signals
//!
//! CLOSED → OPEN on any trigger; OPEN → HALF_OPEN on manual reset or
//! cooldown; HALF_OPEN → CLOSED after one clean tick, back to OPEN on a
//! failing one. A clean tick while CLOSED is an identity transition and is
//! still recorded in the history so recovery streaks are observable. State
//! changes only on ticks and `reset()`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const HISTORY_CAPACITY: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CircuitConfig {
    pub no_progress_threshold: u32,
    pub consecutive_errors_threshold: u32,
    pub completion_signals_threshold: u32,
    pub permission_denials_threshold: u32,
    /// Current output below this fraction of the recent mean trips the
    /// output-decline trigger.
    pub output_decline_ratio: f64,
    /// How many prior output lengths feed the running mean.
    pub output_window: usize,
    /// Optional automatic OPEN → HALF_OPEN after this many seconds.
    pub cooldown_secs: Option<u64>,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            no_progress_threshold: 3,
            consecutive_errors_threshold: 5,
            completion_signals_threshold: 5,
            permission_denials_threshold: 2,
            output_decline_ratio: 0.3,
            output_window: 5,
            cooldown_secs: None,
        }
    }
}

/// Per-iteration health inputs, derived from the response analysis.
#[derive(Clone, Copy, Debug, Default)]
pub struct TickInput {
    pub files_changed: bool,
    pub has_errors: bool,
    pub has_completion_indicator: bool,
    pub exit_signal: bool,
    pub has_permission_denial: bool,
    pub loop_detected: bool,
    pub output_length: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CircuitCounters {
    pub no_progress: u32,
    pub consecutive_errors: u32,
    pub completion_signals: u32,
    pub permission_denials: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

pub struct CircuitBreaker {
    config: CircuitConfig,
    state: CircuitState,
    counters: CircuitCounters,
    recent_output_lengths: VecDeque<usize>,
    last_output_length: usize,
    opened_at: Option<DateTime<Utc>>,
    history: VecDeque<Transition>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            counters: CircuitCounters::default(),
            recent_output_lengths: VecDeque::new(),
            last_output_length: 0,
            opened_at: None,
            history: VecDeque::new(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn counters(&self) -> &CircuitCounters {
        &self.counters
    }

    pub fn last_output_length(&self) -> usize {
        self.last_output_length
    }

    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    /// Restore persisted counters and state on session resume.
    pub fn restore(&mut self, state: CircuitState, counters: CircuitCounters) {
        self.state = state;
        self.counters = counters;
        if state == CircuitState::Open {
            self.opened_at = Some(Utc::now());
        }
    }

    /// Feed one iteration's signals through the state machine.
    pub fn tick(&mut self, input: TickInput) -> CircuitState {
        match self.state {
            CircuitState::Open => {
                if let (Some(cooldown), Some(opened_at)) =
                    (self.config.cooldown_secs, self.opened_at)
                {
                    if (Utc::now() - opened_at).num_seconds() >= cooldown as i64 {
                        self.transition(CircuitState::HalfOpen, "cooldown_elapsed");
                        return self.evaluate_half_open(input);
                    }
                }
                self.state
            }
            CircuitState::HalfOpen => self.evaluate_half_open(input),
            CircuitState::Closed => self.evaluate_closed(input),
        }
    }

    /// Return to CLOSED and clear counters. Idempotent; OPEN moves to
    /// HALF_OPEN first per the recovery path, an explicit second reset (or a
    /// reset from HALF_OPEN) lands on CLOSED.
    pub fn reset(&mut self) {
        self.counters = CircuitCounters::default();
        self.recent_output_lengths.clear();
        match self.state {
            CircuitState::Open => self.transition(CircuitState::HalfOpen, "manual_reset"),
            CircuitState::HalfOpen => self.transition(CircuitState::Closed, "manual_reset"),
            CircuitState::Closed => {}
        }
    }

    fn evaluate_half_open(&mut self, input: TickInput) -> CircuitState {
        let failing = input.has_errors || input.has_permission_denial || input.loop_detected;
        if failing {
            self.update_counters(&input);
            self.transition(CircuitState::Open, "half_open_probe_failed");
        } else {
            self.counters = CircuitCounters::default();
            self.transition(CircuitState::Closed, "half_open_probe_succeeded");
        }
        self.note_output(input.output_length);
        self.state
    }

    fn evaluate_closed(&mut self, input: TickInput) -> CircuitState {
        self.update_counters(&input);

        let c = &self.config;
        let reason = if self.counters.no_progress >= c.no_progress_threshold {
            Some("no_progress")
        } else if self.counters.consecutive_errors >= c.consecutive_errors_threshold {
            Some("consecutive_errors")
        } else if self.counters.completion_signals >= c.completion_signals_threshold {
            Some("completion_indicators_overflow")
        } else if self.counters.permission_denials >= c.permission_denials_threshold {
            Some("permission_denials")
        } else if self.output_declined(input.output_length) {
            Some("output_decline")
        } else {
            None
        };

        self.note_output(input.output_length);

        if let Some(reason) = reason {
            self.transition(CircuitState::Open, reason);
        } else if !input.has_errors && !input.has_permission_denial && !input.loop_detected {
            // CLOSED -> CLOSED on a clean tick is a no-op for state but is
            // still recorded so operators can observe recovery streaks.
            self.record(CircuitState::Closed, CircuitState::Closed, "recovery_tick");
        }
        self.state
    }

    fn update_counters(&mut self, input: &TickInput) {
        if input.files_changed {
            self.counters.no_progress = 0;
        } else if input.loop_detected || !input.has_completion_indicator {
            self.counters.no_progress += 1;
        }

        if input.has_errors {
            self.counters.consecutive_errors += 1;
        } else {
            self.counters.consecutive_errors = 0;
        }

        if input.has_completion_indicator && !input.exit_signal {
            self.counters.completion_signals += 1;
        }

        if input.has_permission_denial {
            self.counters.permission_denials += 1;
        }
    }

    fn output_declined(&self, current: usize) -> bool {
        if self.recent_output_lengths.len() < self.config.output_window {
            return false;
        }
        let mean = self.recent_output_lengths.iter().sum::<usize>() as f64
            / self.recent_output_lengths.len() as f64;
        (current as f64) < mean * self.config.output_decline_ratio
    }

    fn note_output(&mut self, length: usize) {
        self.last_output_length = length;
        if self.recent_output_lengths.len() == self.config.output_window {
            self.recent_output_lengths.pop_front();
        }
        self.recent_output_lengths.push_back(length);
    }

    fn transition(&mut self, to: CircuitState, reason: &str) {
        if self.state == to {
            return;
        }
        tracing::info!(from = %self.state, to = %to, reason, "circuit transition");
        self.record(self.state, to, reason);
        self.state = to;
        self.opened_at = if to == CircuitState::Open {
            Some(Utc::now())
        } else {
            None
        };
    }

    fn record(&mut self, from: CircuitState, to: CircuitState, reason: &str) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(Transition {
            from,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress_tick() -> TickInput {
        TickInput {
            files_changed: true,
            output_length: 500,
            ..Default::default()
        }
    }

    #[test]
    fn stays_closed_on_progress() {
        let mut cb = CircuitBreaker::default();
        for _ in 0..20 {
            assert_eq!(cb.tick(progress_tick()), CircuitState::Closed);
        }
    }

    #[test]
    fn no_progress_opens_at_threshold() {
        let mut cb = CircuitBreaker::default();
        let stalled = TickInput {
            files_changed: false,
            output_length: 500,
            ..Default::default()
        };
        assert_eq!(cb.tick(stalled), CircuitState::Closed);
        assert_eq!(cb.tick(stalled), CircuitState::Closed);
        assert_eq!(cb.tick(stalled), CircuitState::Open);
        assert_eq!(cb.history().last().unwrap().reason, "no_progress");
    }

    #[test]
    fn clean_closed_ticks_are_recorded() {
        let mut cb = CircuitBreaker::default();
        for expected in 1..=3 {
            cb.tick(progress_tick());
            assert_eq!(cb.state(), CircuitState::Closed);
            assert_eq!(cb.history().count(), expected);
        }
        assert!(cb.history().all(|t| {
            t.from == CircuitState::Closed
                && t.to == CircuitState::Closed
                && t.reason == "recovery_tick"
        }));

        // A failing tick is not a recovery tick.
        let erroring = TickInput {
            files_changed: true,
            has_errors: true,
            output_length: 500,
            ..Default::default()
        };
        cb.tick(erroring);
        assert_eq!(
            cb.history().filter(|t| t.reason == "recovery_tick").count(),
            3
        );
    }

    #[test]
    fn file_change_resets_no_progress() {
        let mut cb = CircuitBreaker::default();
        let stalled = TickInput {
            output_length: 500,
            ..Default::default()
        };
        cb.tick(stalled);
        cb.tick(stalled);
        cb.tick(progress_tick());
        assert_eq!(cb.counters().no_progress, 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn consecutive_errors_open_at_five() {
        let mut cb = CircuitBreaker::default();
        let erroring = TickInput {
            files_changed: true, // keep no_progress quiet
            has_errors: true,
            output_length: 500,
            ..Default::default()
        };
        for _ in 0..4 {
            assert_eq!(cb.tick(erroring), CircuitState::Closed);
        }
        assert_eq!(cb.tick(erroring), CircuitState::Open);
        assert_eq!(cb.history().last().unwrap().reason, "consecutive_errors");
    }

    #[test]
    fn clean_tick_resets_error_streak() {
        let mut cb = CircuitBreaker::default();
        let erroring = TickInput {
            files_changed: true,
            has_errors: true,
            output_length: 500,
            ..Default::default()
        };
        cb.tick(erroring);
        cb.tick(erroring);
        cb.tick(progress_tick());
        assert_eq!(cb.counters().consecutive_errors, 0);
    }

    #[test]
    fn completion_claims_without_exit_open_at_five() {
        let mut cb = CircuitBreaker::default();
        let claiming = TickInput {
            files_changed: true,
            has_completion_indicator: true,
            exit_signal: false,
            output_length: 500,
            ..Default::default()
        };
        for _ in 0..4 {
            assert_eq!(cb.tick(claiming), CircuitState::Closed);
        }
        assert_eq!(cb.tick(claiming), CircuitState::Open);
        assert_eq!(
            cb.history().last().unwrap().reason,
            "completion_indicators_overflow"
        );
    }

    #[test]
    fn completion_with_exit_signal_does_not_count() {
        let mut cb = CircuitBreaker::default();
        let exiting = TickInput {
            files_changed: true,
            has_completion_indicator: true,
            exit_signal: true,
            output_length: 500,
            ..Default::default()
        };
        for _ in 0..10 {
            cb.tick(exiting);
        }
        assert_eq!(cb.counters().completion_signals, 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn permission_denials_open_at_two() {
        let mut cb = CircuitBreaker::default();
        let denied = TickInput {
            files_changed: true,
            has_permission_denial: true,
            output_length: 500,
            ..Default::default()
        };
        assert_eq!(cb.tick(denied), CircuitState::Closed);
        assert_eq!(cb.tick(denied), CircuitState::Open);
        assert_eq!(cb.history().last().unwrap().reason, "permission_denials");
    }

    #[test]
    fn output_decline_opens() {
        let mut cb = CircuitBreaker::default();
        for _ in 0..5 {
            cb.tick(progress_tick()); // output 500
        }
        let shrunk = TickInput {
            files_changed: true,
            output_length: 50, // < 30% of 500
            ..Default::default()
        };
        assert_eq!(cb.tick(shrunk), CircuitState::Open);
        assert_eq!(cb.history().last().unwrap().reason, "output_decline");
    }

    #[test]
    fn reset_walks_open_half_open_closed() {
        let mut cb = CircuitBreaker::default();
        let denied = TickInput {
            files_changed: true,
            has_permission_denial: true,
            output_length: 500,
            ..Default::default()
        };
        cb.tick(denied);
        cb.tick(denied);
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // A clean probe closes the circuit.
        assert_eq!(cb.tick(progress_tick()), CircuitState::Closed);
    }

    #[test]
    fn half_open_failing_probe_reopens() {
        let mut cb = CircuitBreaker::default();
        let denied = TickInput {
            has_permission_denial: true,
            files_changed: true,
            output_length: 500,
            ..Default::default()
        };
        cb.tick(denied);
        cb.tick(denied);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let failing = TickInput {
            has_errors: true,
            output_length: 500,
            ..Default::default()
        };
        assert_eq!(cb.tick(failing), CircuitState::Open);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut cb = CircuitBreaker::default();
        cb.reset();
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counters().no_progress, 0);
        assert_eq!(cb.history().count(), 0);
    }

    #[test]
    fn open_state_ignores_ticks_without_cooldown() {
        let mut cb = CircuitBreaker::default();
        let denied = TickInput {
            files_changed: true,
            has_permission_denial: true,
            output_length: 500,
            ..Default::default()
        };
        cb.tick(denied);
        cb.tick(denied);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.tick(progress_tick()), CircuitState::Open);
    }

    #[test]
    fn history_is_bounded() {
        let mut cb = CircuitBreaker::default();
        let denied = TickInput {
            files_changed: true,
            has_permission_denial: true,
            output_length: 500,
            ..Default::default()
        };
        for _ in 0..60 {
            cb.tick(denied);
            cb.tick(denied);
            cb.reset(); // open -> half_open
            cb.reset(); // half_open -> closed
        }
        assert!(cb.history().count() <= 50);
    }
}
