//! Coalesced background work with retry.
//!
//! Several agent duties (FM message retry, replica-up batches, service
//! description updates) share one pattern: requests may arrive in bursts,
//! the work should fire at most once per minimum interval, and a completed
//! run can ask for a retry. This manager coalesces requests and arms the
//! retry timer when the callback reports more work.

use std::sync::Mutex;
use std::time::Duration;

use peridot_types::{ActivityId, Timestamp};
use tracing::debug;

use super::clock::Clock;
use super::retry::RetryTimer;

/// Whether a completed run needs a follow-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryRequirement {
    NotRequired,
    Required,
}

#[derive(Debug)]
struct BackgroundState {
    /// A request arrived while a run was in progress.
    request_pending: bool,

    /// A run is currently executing.
    executing: bool,

    last_run: Option<Timestamp>,
}

/// Background work manager with a minimum inter-run interval and a retry
/// timer.
///
/// `try_begin_run` gates execution; the caller performs the work and
/// reports completion with [`BackgroundWorkManagerWithRetry::on_work_complete`].
pub struct BackgroundWorkManagerWithRetry {
    name: &'static str,
    min_interval: Duration,
    retry_interval: Duration,
    state: Mutex<BackgroundState>,
    retry_timer: RetryTimer,
}

impl BackgroundWorkManagerWithRetry {
    pub fn new(name: &'static str, min_interval: Duration, retry_interval: Duration) -> Self {
        Self {
            name,
            min_interval,
            retry_interval,
            state: Mutex::new(BackgroundState {
                request_pending: false,
                executing: false,
                last_run: None,
            }),
            retry_timer: RetryTimer::new(),
        }
    }

    /// Requests a run. Returns true when the caller should execute now.
    ///
    /// A request during an active run is remembered and honored when the
    /// run completes; a request inside the minimum interval arms the retry
    /// timer instead of running immediately.
    pub fn request(&self, activity_id: ActivityId, clock: &dyn Clock) -> bool {
        let now = clock.now();
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if state.executing {
            state.request_pending = true;
            debug!(work = self.name, %activity_id, "request coalesced into active run");
            return false;
        }

        if let Some(last) = state.last_run {
            if now.duration_since(last) < self.min_interval {
                state.request_pending = true;
                drop(state);
                self.retry_timer.set(last.saturating_add(self.min_interval));
                return false;
            }
        }

        state.executing = true;
        state.request_pending = false;
        state.last_run = Some(now);
        true
    }

    /// Reports run completion. Returns true when the caller should run
    /// again immediately (a request arrived mid-run past the interval).
    pub fn on_work_complete(
        &self,
        requirement: RetryRequirement,
        clock: &dyn Clock,
    ) -> bool {
        let now = clock.now();
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.executing = false;

        if requirement == RetryRequirement::Required {
            drop(state);
            self.retry_timer.set(now.saturating_add(self.retry_interval));
            return false;
        }

        if state.request_pending {
            state.request_pending = false;
            state.executing = true;
            state.last_run = Some(now);
            return true;
        }
        false
    }

    /// Fires the retry timer if due; a fired timer counts as a request.
    pub fn try_fire_retry(&self, clock: &dyn Clock) -> bool {
        if self.retry_timer.try_fire(clock.now()).is_none() {
            return false;
        }
        self.request(ActivityId::generate(), clock)
    }

    pub fn is_retry_armed(&self) -> bool {
        self.retry_timer.is_armed()
    }

    pub fn close(&self) {
        // Any armed sequence is stale after close.
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.request_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::TestClock;

    fn manager() -> BackgroundWorkManagerWithRetry {
        BackgroundWorkManagerWithRetry::new(
            "test",
            Duration::from_millis(100),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn first_request_runs_immediately() {
        let clock = TestClock::new();
        let bgm = manager();
        assert!(bgm.request(ActivityId::generate(), &clock));
    }

    #[test]
    fn request_during_run_coalesces() {
        let clock = TestClock::new();
        let bgm = manager();
        assert!(bgm.request(ActivityId::generate(), &clock));
        assert!(!bgm.request(ActivityId::generate(), &clock));
        assert!(!bgm.request(ActivityId::generate(), &clock));

        clock.advance(Duration::from_millis(200));
        // The coalesced request runs once the active run completes.
        assert!(bgm.on_work_complete(RetryRequirement::NotRequired, &clock));
    }

    #[test]
    fn min_interval_defers_to_retry_timer() {
        let clock = TestClock::new();
        let bgm = manager();
        assert!(bgm.request(ActivityId::generate(), &clock));
        bgm.on_work_complete(RetryRequirement::NotRequired, &clock);

        // Immediately after a run: inside the minimum interval.
        assert!(!bgm.request(ActivityId::generate(), &clock));
        assert!(bgm.is_retry_armed());

        clock.advance(Duration::from_millis(150));
        assert!(bgm.try_fire_retry(&clock));
    }

    #[test]
    fn retry_required_arms_the_timer() {
        let clock = TestClock::new();
        let bgm = manager();
        assert!(bgm.request(ActivityId::generate(), &clock));
        assert!(!bgm.on_work_complete(RetryRequirement::Required, &clock));
        assert!(bgm.is_retry_armed());

        clock.advance(Duration::from_millis(150));
        assert!(bgm.try_fire_retry(&clock));
    }
}
