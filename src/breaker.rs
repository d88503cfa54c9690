//! Per-project circuit breaker.
//!
//! Pure state machine; persistence lives in `db::breakers` and the
//! scheduler decides what a cycle's [`CycleSignals`] were.

use crate::config::BreakerConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest error signature kept for repeat detection.
pub const MAX_SIGNATURE_LEN: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(BreakerState::Closed),
            "open" => Some(BreakerState::Open),
            "half_open" => Some(BreakerState::HalfOpen),
            _ => None,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a scheduling cycle went, from the breaker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A task completed.
    Progress,
    /// Nothing moved and something went wrong, or ready work found no home.
    NoProgress,
    /// Tasks are still running; nothing to judge.
    Neutral,
}

/// What happened during one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleSignals {
    pub completed: usize,
    /// Error text of every failure signal this cycle (task failures, deploy
    /// failures, stuck resets, poll errors).
    pub failures: Vec<String>,
    pub running: usize,
    /// Ready tasks (dependencies met) that could not be placed on any node.
    pub unplaced: usize,
}

impl CycleSignals {
    /// A successful deploy is not progress on its own: a task that fails
    /// deterministically is redeployed every cycle.
    pub fn outcome(&self) -> CycleOutcome {
        if self.completed > 0 {
            CycleOutcome::Progress
        } else if !self.failures.is_empty() || (self.running == 0 && self.unplaced > 0) {
            CycleOutcome::NoProgress
        } else {
            CycleOutcome::Neutral
        }
    }
}

/// A state change worth logging and recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Opened { reason: String },
    HalfOpened,
    Closed,
}

/// Whether assignment may run this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Allow,
    Skip { remaining_ms: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub project: String,
    pub state: BreakerState,
    pub no_progress_cycles: u32,
    pub last_signature: Option<String>,
    pub signature_repeats: u32,
    pub opened_at: Option<i64>,
    pub cooldown_until: Option<i64>,
    pub trips: u32,
}

impl CircuitBreaker {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            state: BreakerState::Closed,
            no_progress_cycles: 0,
            last_signature: None,
            signature_repeats: 0,
            opened_at: None,
            cooldown_until: None,
            trips: 0,
        }
    }

    /// Check the gate at the start of assignment. An elapsed cooldown moves
    /// `Open` to `HalfOpen` and lets this cycle through as the trial.
    pub fn gate(&mut self, now_ms: i64) -> (Gate, Option<Transition>) {
        match self.state {
            BreakerState::Open => {
                let until = self.cooldown_until.unwrap_or(now_ms);
                if now_ms >= until {
                    self.state = BreakerState::HalfOpen;
                    (Gate::Allow, Some(Transition::HalfOpened))
                } else {
                    (Gate::Skip { remaining_ms: until - now_ms }, None)
                }
            }
            BreakerState::Closed | BreakerState::HalfOpen => (Gate::Allow, None),
        }
    }

    /// Feed a finished cycle into the breaker.
    pub fn record(&mut self, signals: &CycleSignals, config: &BreakerConfig, now_ms: i64) -> Option<Transition> {
        let outcome = signals.outcome();

        match (self.state, outcome) {
            (BreakerState::Open, _) => None,
            (_, CycleOutcome::Neutral) => None,
            (BreakerState::HalfOpen, CycleOutcome::Progress) => {
                self.reset_counters();
                self.state = BreakerState::Closed;
                Some(Transition::Closed)
            }
            (BreakerState::HalfOpen, CycleOutcome::NoProgress) => {
                Some(self.trip("trial cycle made no progress".to_string(), config, now_ms))
            }
            (BreakerState::Closed, CycleOutcome::Progress) => {
                self.reset_counters();
                None
            }
            (BreakerState::Closed, CycleOutcome::NoProgress) => {
                self.no_progress_cycles += 1;
                for failure in &signals.failures {
                    self.note_signature(normalize_signature(failure));
                }

                if self.signature_repeats >= config.repeat_error_threshold {
                    let sig = self.last_signature.clone().unwrap_or_default();
                    let reason = format!("error repeated {} times: {}", self.signature_repeats, sig);
                    Some(self.trip(reason, config, now_ms))
                } else if self.no_progress_cycles >= config.no_progress_threshold {
                    let reason = format!("{} consecutive cycles without progress", self.no_progress_cycles);
                    Some(self.trip(reason, config, now_ms))
                } else {
                    None
                }
            }
        }
    }

    /// Operator reset back to `Closed`.
    pub fn close(&mut self) -> bool {
        let was_closed = self.state == BreakerState::Closed;
        self.reset_counters();
        self.state = BreakerState::Closed;
        self.opened_at = None;
        self.cooldown_until = None;
        !was_closed
    }

    fn note_signature(&mut self, sig: String) {
        if self.last_signature.as_deref() == Some(sig.as_str()) {
            self.signature_repeats += 1;
        } else {
            self.last_signature = Some(sig);
            self.signature_repeats = 1;
        }
    }

    fn reset_counters(&mut self) {
        self.no_progress_cycles = 0;
        self.last_signature = None;
        self.signature_repeats = 0;
    }

    fn trip(&mut self, reason: String, config: &BreakerConfig, now_ms: i64) -> Transition {
        self.state = BreakerState::Open;
        self.opened_at = Some(now_ms);
        self.cooldown_until = Some(now_ms + config.cooldown_ms());
        self.trips += 1;
        self.reset_counters();
        Transition::Opened { reason }
    }
}

/// Collapse run-specific detail so the same failure compares equal across
/// tasks: digit runs become `#`, whitespace is squeezed, length is capped.
pub fn normalize_signature(error: &str) -> String {
    let mut out = String::with_capacity(error.len().min(MAX_SIGNATURE_LEN));
    let mut in_digits = false;
    let mut in_space = false;

    for c in error.trim().chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push('#');
            }
            in_digits = true;
            in_space = false;
        } else if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
            in_digits = false;
        } else {
            out.push(c);
            in_digits = false;
            in_space = false;
        }
    }

    out.chars().take(MAX_SIGNATURE_LEN).collect()
}
