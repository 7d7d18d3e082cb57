//! Retry timers and randomized backoff.

use std::sync::Mutex;
use std::time::Duration;

use peridot_types::Timestamp;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

// ============================================================================
// Retry policy
// ============================================================================

/// Coarse error categories used to pick a retry delay distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient local condition (busy store, lock conflict): retry soon.
    TransientLocal,

    /// Remote or quorum condition (not primary, reconfiguration pending):
    /// give the cluster time to settle.
    ClusterSettling,

    /// Dependency not available yet (service type not registered, host
    /// starting): back off the longest.
    DependencyPending,
}

/// Randomized retry-delay helper.
///
/// Delays are always jittered: deterministic retry intervals synchronize
/// retries across a node's failover units and produce thundering herds.
pub struct RetryPolicy {
    rng: Mutex<SmallRng>,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Deterministically seeded policy for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    /// Picks a jittered delay for `category`, never exceeding `max_delay`.
    pub fn randomize(&self, category: ErrorCategory, max_delay: Duration) -> Duration {
        let (low_pct, high_pct) = match category {
            ErrorCategory::TransientLocal => (10, 40),
            ErrorCategory::ClusterSettling => (30, 80),
            ErrorCategory::DependencyPending => (60, 100),
        };

        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let pct = rng.gen_range(low_pct..=high_pct);
        max_delay.mul_f64(f64::from(pct) / 100.0)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Retry timer
// ============================================================================

#[derive(Debug, Default)]
struct TimerState {
    /// Sequence of the currently armed deadline, if any.
    armed: Option<(u64, Timestamp)>,
    next_sequence: u64,
}

/// A one-shot retry timer cancellable by sequence number.
///
/// Arming returns a sequence; cancelling a stale sequence is a no-op, so a
/// completion racing a re-arm cannot cancel the newer deadline. The runtime
/// drives firing by polling [`RetryTimer::try_fire`] with the current time.
#[derive(Debug, Default)]
pub struct RetryTimer {
    state: Mutex<TimerState>,
}

impl RetryTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms (or re-arms) the timer. Returns the new sequence number.
    pub fn set(&self, deadline: Timestamp) -> u64 {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.armed = Some((sequence, deadline));
        sequence
    }

    /// Cancels the timer if `sequence` is still the armed one.
    pub fn cancel(&self, sequence: u64) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some((armed, _)) = state.armed {
            if armed == sequence {
                state.armed = None;
            }
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .armed
            .is_some()
    }

    /// Fires the timer if its deadline has passed. Returns the fired
    /// sequence.
    pub fn try_fire(&self, now: Timestamp) -> Option<u64> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match state.armed {
            Some((sequence, deadline)) if now >= deadline => {
                state.armed = None;
                Some(sequence)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn randomized_delays_stay_bounded() {
        let policy = RetryPolicy::with_seed(7);
        let max = Duration::from_secs(10);
        for _ in 0..100 {
            let d = policy.randomize(ErrorCategory::TransientLocal, max);
            assert!(d <= max);
            assert!(d >= Duration::from_millis(500));
        }
    }

    #[test]
    fn categories_shift_the_distribution() {
        let policy = RetryPolicy::with_seed(7);
        let max = Duration::from_secs(10);

        // Dependency delays are never shorter than the transient floor.
        for _ in 0..50 {
            let d = policy.randomize(ErrorCategory::DependencyPending, max);
            assert!(d >= Duration::from_secs(6));
        }
    }

    #[test]
    fn stale_cancel_is_a_noop() {
        let timer = RetryTimer::new();
        let first = timer.set(Timestamp::from_nanos(100));
        let second = timer.set(Timestamp::from_nanos(200));

        timer.cancel(first);
        assert!(timer.is_armed(), "stale cancel must not disarm");

        timer.cancel(second);
        assert!(!timer.is_armed());
    }

    #[test]
    fn fires_once_after_deadline() {
        let timer = RetryTimer::new();
        let seq = timer.set(Timestamp::from_nanos(100));

        assert_eq!(timer.try_fire(Timestamp::from_nanos(50)), None);
        assert_eq!(timer.try_fire(Timestamp::from_nanos(150)), Some(seq));
        assert_eq!(timer.try_fire(Timestamp::from_nanos(200)), None);
    }
}
