//! Smoke alert debouncing
//!
//! A single confident verdict is not enough to raise the alert. The alert
//! asserts once [`debounce::CONSECUTIVE_THRESHOLD`] qualifying smoke verdicts
//! arrive back to back, and drops on the first verdict that does not qualify.

use crate::constants::debounce;
use crate::engine::verdict::ClassifierVerdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebounceState {
    pub consecutive_positive_count: u32,
    pub asserted: bool,
}

/// Coarse view of [`DebounceState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebouncePhase {
    Idle,
    Counting(u32),
    Asserted,
}

#[derive(Debug, Clone)]
pub struct SmokeDebouncer {
    state: DebounceState,
    threshold: u32,
}

impl SmokeDebouncer {
    pub fn new() -> Self {
        Self {
            state: DebounceState::default(),
            threshold: debounce::CONSECUTIVE_THRESHOLD,
        }
    }

    /// Feed one verdict in arrival order. Returns true if the asserted flag changed.
    pub fn feed(&mut self, verdict: &ClassifierVerdict) -> bool {
        let was_asserted = self.state.asserted;

        if verdict.is_qualifying_smoke() {
            self.state.consecutive_positive_count =
                self.state.consecutive_positive_count.saturating_add(1);
            self.state.asserted = self.state.consecutive_positive_count >= self.threshold;
        } else {
            self.state = DebounceState::default();
        }

        was_asserted != self.state.asserted
    }

    pub fn is_asserted(&self) -> bool {
        self.state.asserted
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn phase(&self) -> DebouncePhase {
        match self.state.consecutive_positive_count {
            0 => DebouncePhase::Idle,
            _ if self.state.asserted => DebouncePhase::Asserted,
            k => DebouncePhase::Counting(k),
        }
    }
}

impl Default for SmokeDebouncer {
    fn default() -> Self {
        Self::new()
    }
}
