//! Reconfiguration phase tracking.
//!
//! A reconfiguration walks the phases in order and never skips:
//!
//! ```text
//! Idle ──(swap only)──► Phase0_Demote
//!      ──────────────► Phase1_GetLsn ──► Phase2_Catchup
//!                        ──► Phase3_Deactivate ──► Phase4_Activate ──► Idle
//! ```
//!
//! Each phase records its start time and a per-replica progress vector;
//! when a phase exceeds its configured timeout the agent emits a
//! "reconfiguration stuck" health report naming the delinquent replicas.

use std::collections::BTreeMap;

use peridot_types::{Lsn, ReplicaId, Timestamp};
use serde::{Deserialize, Serialize};

/// The phases of a reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum ReconfigurationPhase {
    #[default]
    None,

    /// Primary swap only: demote the old primary first.
    Phase0Demote,

    /// Collect LSNs from the replica set to find the most advanced state.
    Phase1GetLsn,

    /// Catch the local replica (and quorum) up to the highest LSN.
    Phase2Catchup,

    /// Deactivate the previous configuration.
    Phase3Deactivate,

    /// Activate the current configuration.
    Phase4Activate,
}

impl std::fmt::Display for ReconfigurationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReconfigurationPhase::None => "None",
            ReconfigurationPhase::Phase0Demote => "Phase0_Demote",
            ReconfigurationPhase::Phase1GetLsn => "Phase1_GetLSN",
            ReconfigurationPhase::Phase2Catchup => "Phase2_Catchup",
            ReconfigurationPhase::Phase3Deactivate => "Phase3_Deactivate",
            ReconfigurationPhase::Phase4Activate => "Phase4_Activate",
        };
        write!(f, "{s}")
    }
}

/// Why a phase is not progressing (attached to stuck-health reports).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StuckReason {
    #[default]
    None,
    Phase0NoReplyFromProxy,
    Phase1WaitingForReadQuorum,
    Phase1DataLoss,
    Phase2NoReplyFromProxy,
    Phase3WaitingForReplicas,
    Phase3PcBelowReadQuorum,
    Phase4UpReadyReplicasPending,
    Phase4LocalReplicaNotReplied,
}

/// Per-replica progress within the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReplicaProgress {
    pub replied: bool,
    pub lsn: Option<Lsn>,
}

/// The reconfiguration state carried by a failover unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReconfigurationState {
    pub phase: ReconfigurationPhase,
    pub phase_started_at: Timestamp,

    /// Progress of the replicas the current phase is waiting on.
    pub progress: BTreeMap<ReplicaId, ReplicaProgress>,

    pub is_primary_swap: bool,

    /// LSN the replica set must reach during Phase2 catch-up.
    pub catchup_target: Option<Lsn>,

    /// Set once the stuck-health warning for the current phase was emitted.
    pub stuck_reported: bool,
}

impl ReconfigurationState {
    pub fn is_active(&self) -> bool {
        self.phase != ReconfigurationPhase::None
    }

    /// Starts a reconfiguration at `phase`, waiting on `waiting_on`.
    pub fn start(
        &mut self,
        phase: ReconfigurationPhase,
        now: Timestamp,
        waiting_on: impl IntoIterator<Item = ReplicaId>,
        is_primary_swap: bool,
    ) {
        self.phase = phase;
        self.phase_started_at = now;
        self.is_primary_swap = is_primary_swap;
        self.stuck_reported = false;
        self.progress = waiting_on
            .into_iter()
            .map(|id| (id, ReplicaProgress::default()))
            .collect();
    }

    /// Moves to the next phase, resetting the progress vector.
    pub fn advance(
        &mut self,
        phase: ReconfigurationPhase,
        now: Timestamp,
        waiting_on: impl IntoIterator<Item = ReplicaId>,
    ) {
        debug_assert!(phase > self.phase, "phases never move backwards");
        self.phase = phase;
        self.phase_started_at = now;
        self.stuck_reported = false;
        self.progress = waiting_on
            .into_iter()
            .map(|id| (id, ReplicaProgress::default()))
            .collect();
    }

    /// Records a reply from `replica`. Returns false for replicas the
    /// current phase is not waiting on (stale replies).
    pub fn record_reply(&mut self, replica: ReplicaId, lsn: Option<Lsn>) -> bool {
        match self.progress.get_mut(&replica) {
            Some(progress) => {
                progress.replied = true;
                if lsn.is_some() {
                    progress.lsn = lsn;
                }
                true
            }
            None => false,
        }
    }

    pub fn replied_count(&self) -> usize {
        self.progress.values().filter(|p| p.replied).count()
    }

    pub fn all_replied(&self) -> bool {
        self.progress.values().all(|p| p.replied)
    }

    /// Replicas that have not replied in the current phase.
    pub fn delinquent(&self) -> Vec<ReplicaId> {
        self.progress
            .iter()
            .filter(|(_, p)| !p.replied)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Highest LSN reported so far (Phase1).
    pub fn max_reported_lsn(&self) -> Option<Lsn> {
        self.progress.values().filter_map(|p| p.lsn).max()
    }

    /// Completes the reconfiguration.
    pub fn complete(&mut self) {
        *self = ReconfigurationState::default();
    }

    /// The stuck reason matching the current phase.
    pub fn stuck_reason(&self) -> StuckReason {
        match self.phase {
            ReconfigurationPhase::None => StuckReason::None,
            ReconfigurationPhase::Phase0Demote => StuckReason::Phase0NoReplyFromProxy,
            ReconfigurationPhase::Phase1GetLsn => StuckReason::Phase1WaitingForReadQuorum,
            ReconfigurationPhase::Phase2Catchup => StuckReason::Phase2NoReplyFromProxy,
            ReconfigurationPhase::Phase3Deactivate => StuckReason::Phase3WaitingForReplicas,
            ReconfigurationPhase::Phase4Activate => StuckReason::Phase4UpReadyReplicasPending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_track_progress_and_delinquents() {
        let mut state = ReconfigurationState::default();
        let now = Timestamp::from_nanos(100);
        let r1 = ReplicaId::new(1);
        let r2 = ReplicaId::new(2);

        state.start(ReconfigurationPhase::Phase1GetLsn, now, [r1, r2], false);
        assert!(state.is_active());
        assert_eq!(state.delinquent(), vec![r1, r2]);

        assert!(state.record_reply(r1, Some(Lsn::new(9))));
        assert_eq!(state.replied_count(), 1);
        assert_eq!(state.delinquent(), vec![r2]);
        assert_eq!(state.max_reported_lsn(), Some(Lsn::new(9)));

        // A reply from a replica the phase is not waiting on is stale.
        assert!(!state.record_reply(ReplicaId::new(99), None));

        state.advance(ReconfigurationPhase::Phase2Catchup, now, []);
        assert!(state.all_replied());

        state.complete();
        assert!(!state.is_active());
    }

    #[test]
    fn stuck_reason_follows_phase() {
        let mut state = ReconfigurationState::default();
        state.start(
            ReconfigurationPhase::Phase2Catchup,
            Timestamp::from_nanos(1),
            [],
            false,
        );
        assert_eq!(state.stuck_reason(), StuckReason::Phase2NoReplyFromProxy);
    }
}
