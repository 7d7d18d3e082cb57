//! Per-application upgrade state machine.
//!
//! Coordinates replica closure, version change and reopen for one
//! application, with cooperative cancellation:
//!
//! - incoming upgrade instance numbers are monotonic; a newer instance
//!   supersedes an older one only when the older is at a queue-eligible
//!   state or has completed
//! - cancel applies immediately at a cancel-safe state and is deferred to
//!   the next state boundary otherwise
//! - a rollback snapshot records whether replicas were closed so rollback
//!   can reopen them
//!
//! At most one upgrade executes per application at a time; a second slot
//! queues the pending cancel or replacement.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Stages of one upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeStage {
    /// Accepted, not yet started.
    Queued,

    /// Closing the application's replicas.
    CloseReplicas,

    /// Switching the application version.
    SwitchVersion,

    /// Reopening replicas on the new version.
    ReopenReplicas,

    Completed,

    /// Cooperative cancel observed at a safe boundary.
    Cancelling,

    /// Terminal after cancel or rollback.
    Closed,

    /// Reverting with the rollback snapshot.
    RollingBack,
}

impl UpgradeStage {
    /// Whether a cancel may take effect in this stage without waiting.
    pub fn is_cancel_safe(self) -> bool {
        matches!(
            self,
            UpgradeStage::Queued | UpgradeStage::Completed | UpgradeStage::Closed
        )
    }

    /// Whether a newer instance may replace an upgrade in this stage.
    pub fn is_queue_eligible(self) -> bool {
        matches!(
            self,
            UpgradeStage::Queued | UpgradeStage::Completed | UpgradeStage::Closed
        )
    }
}

/// How a stage executes (drives the caller's scheduling).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Sync,
    Async,
    TimerRetry,
}

/// What rollback must undo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RollbackSnapshot {
    /// Replicas were closed by this upgrade and must be reopened.
    pub replicas_closed: bool,

    pub previous_version: String,
}

/// One tracked upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upgrade {
    pub instance: u64,
    pub target_version: String,
    pub stage: UpgradeStage,
    pub rollback: RollbackSnapshot,

    /// Deferred cancel waiting for a safe boundary.
    pub cancel_requested: bool,
}

/// Decision on an incoming upgrade request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeDecision {
    /// The upgrade started executing.
    Started,

    /// Queued behind the executing upgrade; it takes over when the current
    /// one reaches a queue-eligible state.
    Queued,

    /// The instance is not newer than what the machine has seen; dropped.
    Stale,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// Cancelled at a safe state.
    Cancelled,

    /// Cancel recorded; applies at the next safe boundary.
    Deferred,

    /// No such upgrade instance.
    NotFound,
}

#[derive(Debug, Default)]
struct Slots {
    current: Option<Upgrade>,
    queued: Option<Upgrade>,
    highest_instance_seen: u64,
}

/// The per-application upgrade engine.
pub struct UpgradeStateMachine {
    application: String,
    current_version: Mutex<String>,
    slots: Mutex<Slots>,
}

impl UpgradeStateMachine {
    pub fn new(application: impl Into<String>, current_version: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            current_version: Mutex::new(current_version.into()),
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn current_version(&self) -> String {
        self.current_version
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn current(&self) -> Option<Upgrade> {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .current
            .clone()
    }

    /// Accepts an upgrade request.
    pub fn process_upgrade(&self, instance: u64, target_version: &str) -> UpgradeDecision {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if instance <= slots.highest_instance_seen {
            debug!(
                app = %self.application,
                instance,
                highest = slots.highest_instance_seen,
                "dropping stale upgrade instance"
            );
            return UpgradeDecision::Stale;
        }
        slots.highest_instance_seen = instance;

        let upgrade = Upgrade {
            instance,
            target_version: target_version.to_string(),
            stage: UpgradeStage::Queued,
            rollback: RollbackSnapshot {
                replicas_closed: false,
                previous_version: self.current_version(),
            },
            cancel_requested: false,
        };

        match &slots.current {
            Some(current) if !current.stage.is_queue_eligible() => {
                // An upgrade is mid-flight; the newer one waits its turn.
                slots.queued = Some(upgrade);
                UpgradeDecision::Queued
            }
            _ => {
                slots.current = Some(Upgrade {
                    stage: UpgradeStage::CloseReplicas,
                    ..upgrade
                });
                info!(app = %self.application, instance, target_version, "upgrade started");
                UpgradeDecision::Started
            }
        }
    }

    /// Requests cancellation of `instance`.
    pub fn cancel(&self, instance: u64) -> CancelResult {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if slots.queued.as_ref().is_some_and(|q| q.instance == instance) {
            slots.queued = None;
            return CancelResult::Cancelled;
        }

        let Some(current) = &mut slots.current else {
            return CancelResult::NotFound;
        };
        if current.instance != instance {
            return CancelResult::NotFound;
        }

        if current.stage.is_cancel_safe() {
            current.stage = UpgradeStage::Closed;
            info!(app = %self.application, instance, "upgrade cancelled");
            CancelResult::Cancelled
        } else {
            current.cancel_requested = true;
            CancelResult::Deferred
        }
    }

    /// The execution kind of a stage (how the caller schedules it).
    pub fn stage_kind(stage: UpgradeStage) -> StageKind {
        match stage {
            UpgradeStage::Queued | UpgradeStage::Completed | UpgradeStage::Closed => {
                StageKind::Sync
            }
            UpgradeStage::CloseReplicas
            | UpgradeStage::ReopenReplicas
            | UpgradeStage::RollingBack => StageKind::TimerRetry,
            UpgradeStage::SwitchVersion | UpgradeStage::Cancelling => StageKind::Async,
        }
    }

    /// Completes the current stage and moves to the next one.
    ///
    /// A deferred cancel is honored here, at the stage boundary. Returns
    /// the new stage, or `None` when no upgrade is executing.
    pub fn complete_stage(&self) -> Option<UpgradeStage> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let current = slots.current.as_mut()?;

        if current.cancel_requested {
            current.cancel_requested = false;
            current.stage = UpgradeStage::Cancelling;
            return Some(UpgradeStage::Cancelling);
        }

        current.stage = match current.stage {
            UpgradeStage::Queued => UpgradeStage::CloseReplicas,
            UpgradeStage::CloseReplicas => {
                current.rollback.replicas_closed = true;
                UpgradeStage::SwitchVersion
            }
            UpgradeStage::SwitchVersion => {
                *self
                    .current_version
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) =
                    current.target_version.clone();
                UpgradeStage::ReopenReplicas
            }
            UpgradeStage::ReopenReplicas => {
                info!(
                    app = %self.application,
                    instance = current.instance,
                    version = %current.target_version,
                    "upgrade completed"
                );
                UpgradeStage::Completed
            }
            UpgradeStage::Cancelling => UpgradeStage::Closed,
            UpgradeStage::RollingBack => UpgradeStage::Closed,
            terminal @ (UpgradeStage::Completed | UpgradeStage::Closed) => terminal,
        };
        let stage = current.stage;

        // A queued upgrade takes over once the current one is done.
        if stage.is_queue_eligible() {
            if let Some(mut queued) = slots.queued.take() {
                queued.stage = UpgradeStage::CloseReplicas;
                slots.current = Some(queued);
            }
        }

        Some(stage)
    }

    /// Starts a rollback of the current upgrade using its snapshot.
    ///
    /// Returns the snapshot so the caller knows whether replicas must be
    /// reopened.
    pub fn begin_rollback(&self) -> Option<RollbackSnapshot> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let current = slots.current.as_mut()?;

        let snapshot = current.rollback.clone();
        *self
            .current_version
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) =
            snapshot.previous_version.clone();
        current.stage = UpgradeStage::RollingBack;
        info!(
            app = %self.application,
            instance = current.instance,
            reopen_replicas = snapshot.replicas_closed,
            "upgrade rolling back"
        );
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> UpgradeStateMachine {
        UpgradeStateMachine::new("fabric:/app", "1.0")
    }

    fn run_to_completion(machine: &UpgradeStateMachine) {
        while let Some(stage) = machine.complete_stage() {
            if matches!(stage, UpgradeStage::Completed | UpgradeStage::Closed) {
                break;
            }
        }
    }

    #[test]
    fn upgrade_walks_the_stages_and_switches_version() {
        let machine = machine();
        assert_eq!(machine.process_upgrade(1, "2.0"), UpgradeDecision::Started);

        assert_eq!(machine.complete_stage(), Some(UpgradeStage::SwitchVersion));
        assert_eq!(machine.complete_stage(), Some(UpgradeStage::ReopenReplicas));
        assert_eq!(machine.current_version(), "2.0");
        assert_eq!(machine.complete_stage(), Some(UpgradeStage::Completed));
    }

    #[test]
    fn stale_instances_are_dropped() {
        let machine = machine();
        machine.process_upgrade(5, "2.0");
        assert_eq!(machine.process_upgrade(5, "2.1"), UpgradeDecision::Stale);
        assert_eq!(machine.process_upgrade(4, "2.1"), UpgradeDecision::Stale);
    }

    #[test]
    fn newer_instance_queues_behind_executing_upgrade() {
        let machine = machine();
        machine.process_upgrade(1, "2.0");
        assert_eq!(machine.process_upgrade(2, "3.0"), UpgradeDecision::Queued);

        run_to_completion(&machine);

        // The queued upgrade took over.
        let current = machine.current().unwrap();
        assert_eq!(current.instance, 2);
        assert_eq!(current.stage, UpgradeStage::CloseReplicas);

        run_to_completion(&machine);
        assert_eq!(machine.current_version(), "3.0");
    }

    #[test]
    fn cancel_mid_flight_is_deferred_to_the_boundary() {
        let machine = machine();
        machine.process_upgrade(1, "2.0");

        assert_eq!(machine.cancel(1), CancelResult::Deferred);
        assert_eq!(machine.complete_stage(), Some(UpgradeStage::Cancelling));
        assert_eq!(machine.complete_stage(), Some(UpgradeStage::Closed));
        assert_eq!(machine.current_version(), "1.0");
    }

    #[test]
    fn cancel_of_queued_upgrade_is_immediate() {
        let machine = machine();
        machine.process_upgrade(1, "2.0");
        machine.process_upgrade(2, "3.0");
        assert_eq!(machine.cancel(2), CancelResult::Cancelled);

        run_to_completion(&machine);
        assert_eq!(machine.current_version(), "2.0");
    }

    #[test]
    fn rollback_restores_version_and_reports_snapshot() {
        let machine = machine();
        machine.process_upgrade(1, "2.0");
        machine.complete_stage(); // CloseReplicas done -> SwitchVersion

        let snapshot = machine.begin_rollback().unwrap();
        assert!(snapshot.replicas_closed);
        assert_eq!(machine.current_version(), "1.0");
        assert_eq!(machine.complete_stage(), Some(UpgradeStage::Closed));
    }

    #[test]
    fn unknown_instance_cancel_is_not_found() {
        let machine = machine();
        machine.process_upgrade(1, "2.0");
        assert_eq!(machine.cancel(9), CancelResult::NotFound);
    }
}
