//! Consecutive-failure tracking for replica operations.
//!
//! Open, reopen, change-role and close are retried on failure; the
//! thresholds decide when retrying escalates:
//!
//! - below `warning`: keep retrying quietly
//! - at `warning`: emit a warning health report
//! - at `error`: emit an error health report (still retrying)
//! - at `restart`: request termination of the hosting process
//! - at `drop`: give up, mark the replica dropped and inform the FM

use serde::{Deserialize, Serialize};

/// Escalation thresholds (consecutive failures).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryableErrorThresholds {
    pub warning: u32,
    pub error: u32,
    pub restart: u32,
    pub drop: u32,
}

impl Default for RetryableErrorThresholds {
    fn default() -> Self {
        Self {
            warning: 3,
            error: 5,
            restart: 8,
            drop: 10,
        }
    }
}

/// The escalation a failure count maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableErrorAction {
    /// Keep retrying.
    None,
    ReportWarning,
    ReportError,
    RestartHost,
    Drop,
}

/// Consecutive-failure state for one replica operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetryableErrorState {
    consecutive_failures: u32,
}

impl RetryableErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u32 {
        self.consecutive_failures
    }

    /// Records a failure and returns the escalation it triggers.
    pub fn on_failure(&mut self, thresholds: RetryableErrorThresholds) -> RetryableErrorAction {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let count = self.consecutive_failures;

        if count >= thresholds.drop {
            RetryableErrorAction::Drop
        } else if count >= thresholds.restart {
            RetryableErrorAction::RestartHost
        } else if count >= thresholds.error {
            RetryableErrorAction::ReportError
        } else if count >= thresholds.warning {
            RetryableErrorAction::ReportWarning
        } else {
            RetryableErrorAction::None
        }
    }

    /// A success resets the ladder.
    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn ladder_escalates_in_order() {
        let thresholds = RetryableErrorThresholds::default();
        let mut state = RetryableErrorState::new();

        let mut actions = Vec::new();
        for _ in 0..10 {
            actions.push(state.on_failure(thresholds));
        }

        assert_eq!(actions[0], RetryableErrorAction::None);
        assert_eq!(actions[2], RetryableErrorAction::ReportWarning);
        assert_eq!(actions[4], RetryableErrorAction::ReportError);
        assert_eq!(actions[7], RetryableErrorAction::RestartHost);
        assert_eq!(actions[9], RetryableErrorAction::Drop);
    }

    #[test]
    fn success_resets_the_count() {
        let thresholds = RetryableErrorThresholds::default();
        let mut state = RetryableErrorState::new();

        for _ in 0..4 {
            state.on_failure(thresholds);
        }
        state.on_success();
        assert_eq!(state.count(), 0);
        assert_eq!(state.on_failure(thresholds), RetryableErrorAction::None);
    }

    #[test_case(1, RetryableErrorAction::None)]
    #[test_case(3, RetryableErrorAction::ReportWarning)]
    #[test_case(5, RetryableErrorAction::ReportError)]
    #[test_case(8, RetryableErrorAction::RestartHost)]
    #[test_case(10, RetryableErrorAction::Drop)]
    #[test_case(12, RetryableErrorAction::Drop)]
    fn action_at_count(count: u32, expected: RetryableErrorAction) {
        let thresholds = RetryableErrorThresholds::default();
        let mut state = RetryableErrorState::new();
        let mut last = RetryableErrorAction::None;
        for _ in 0..count {
            last = state.on_failure(thresholds);
        }
        assert_eq!(last, expected);
    }
}
