//! Deadlock detector for critical sections.
//!
//! A section (an entity commit, a proxy call) registers when it starts and
//! deregisters when it finishes. The periodic check fails the process with
//! a structured panic when a section exceeds its budget, so a dump points
//! at the stuck operation instead of a silent hang.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use peridot_types::Timestamp;

#[derive(Debug)]
struct Section {
    name: &'static str,
    since: Timestamp,
}

#[derive(Debug, Default)]
struct DetectorState {
    next_id: u64,
    sections: HashMap<u64, Section>,
}

/// Watchdog over critical sections.
#[derive(Debug)]
pub struct DeadlockDetector {
    budget: Duration,

    /// When false, overruns are reported to tracing instead of aborting.
    fail_fast: bool,

    state: Mutex<DetectorState>,
}

impl DeadlockDetector {
    pub fn new(budget: Duration, fail_fast: bool) -> Arc<Self> {
        Arc::new(Self {
            budget,
            fail_fast,
            state: Mutex::new(DetectorState::default()),
        })
    }

    /// Registers a section; the returned guard deregisters on drop.
    pub fn enter(self: &Arc<Self>, name: &'static str, now: Timestamp) -> SectionGuard {
        let id = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let id = state.next_id;
            state.next_id += 1;
            state.sections.insert(id, Section { name, since: now });
            id
        };
        SectionGuard {
            detector: self.clone(),
            id,
        }
    }

    /// Checks every live section against the budget.
    ///
    /// Returns the names of overrunning sections. With `fail_fast` the
    /// first overrun panics instead, so the process dump names the stuck
    /// operation.
    pub fn check(&self, now: Timestamp) -> Vec<&'static str> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut overruns = Vec::new();
        for section in state.sections.values() {
            if now.duration_since(section.since) > self.budget {
                if self.fail_fast {
                    panic!(
                        "critical section '{}' exceeded its {}ms budget (started at {})",
                        section.name,
                        self.budget.as_millis(),
                        section.since
                    );
                }
                tracing::error!(
                    section = section.name,
                    budget_ms = self.budget.as_millis() as u64,
                    "critical section exceeded its budget"
                );
                overruns.push(section.name);
            }
        }
        overruns
    }

    pub fn live_sections(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .sections
            .len()
    }

    fn exit(&self, id: u64) {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .sections
            .remove(&id);
    }
}

/// RAII registration of one critical section.
pub struct SectionGuard {
    detector: Arc<DeadlockDetector>,
    id: u64,
}

impl Drop for SectionGuard {
    fn drop(&mut self) {
        self.detector.exit(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_sections_never_trip() {
        let detector = DeadlockDetector::new(Duration::from_millis(100), false);
        {
            let _guard = detector.enter("commit", Timestamp::from_nanos(0));
        }
        assert_eq!(detector.live_sections(), 0);
        assert!(detector.check(Timestamp::from_nanos(u64::MAX)).is_empty());
    }

    #[test]
    fn overrunning_section_is_reported() {
        let detector = DeadlockDetector::new(Duration::from_millis(100), false);
        let _guard = detector.enter("commit", Timestamp::from_nanos(0));

        assert!(detector.check(Timestamp::from_nanos(50_000_000)).is_empty());
        let overruns = detector.check(Timestamp::from_nanos(200_000_000));
        assert_eq!(overruns, vec!["commit"]);
    }

    #[test]
    #[should_panic(expected = "exceeded its 100ms budget")]
    fn fail_fast_panics_on_overrun() {
        let detector = DeadlockDetector::new(Duration::from_millis(100), true);
        let _guard = detector.enter("commit", Timestamp::from_nanos(0));
        detector.check(Timestamp::from_nanos(200_000_000));
    }
}
