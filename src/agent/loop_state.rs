//! Sub-agent loop state
//!
//! Tracks the turn counter and wall clock of one sub-agent run and decides
//! when a budget has run out.

use std::time::Duration;

use tokio::time::Instant;

use crate::agent::sub_agent::SubagentTerminateMode;

/// Budget bookkeeping for a sub-agent run
#[derive(Debug, Clone)]
pub struct LoopState {
    /// Turns started so far
    pub turn: usize,
    /// Turn cap; `None` means unbounded
    pub max_turns: Option<usize>,
    /// Wall-clock cap
    pub max_time: Duration,
    started: Instant,
}

impl LoopState {
    /// Start the clock
    pub fn new(max_turns: Option<usize>, max_time_minutes: f64) -> Self {
        Self {
            turn: 0,
            max_turns,
            max_time: Duration::from_secs_f64(max_time_minutes.max(0.0) * 60.0),
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_timed_out(&self) -> bool {
        self.elapsed() >= self.max_time
    }

    /// Checked before each turn; the turn cap wins over the clock
    pub fn check_budget(&self) -> Option<SubagentTerminateMode> {
        if self.max_turns.is_some_and(|max| self.turn >= max) {
            return Some(SubagentTerminateMode::MaxTurns);
        }
        if self.is_timed_out() {
            return Some(SubagentTerminateMode::Timeout);
        }
        None
    }

    /// Increment the turn counter
    pub fn next_turn(&mut self) {
        self.turn += 1;
    }
}
