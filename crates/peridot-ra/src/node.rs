//! Node-level agent state: deactivation and the replica-up backlog.

use std::collections::BTreeSet;
use std::sync::Mutex;

use peridot_types::{FailoverManagerKind, FailoverUnitId};
use peridot_wire::NodeActivationBody;
use tracing::{debug, info};

// ============================================================================
// Node deactivation
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct ActivationState {
    sequence_number: i64,
    is_activated: bool,
}

impl Default for ActivationState {
    fn default() -> Self {
        Self {
            sequence_number: -1,
            is_activated: true,
        }
    }
}

/// Per-FM activation state of the node.
///
/// A deactivation closes all local replicas of that FM's partitions and
/// refuses activation-dependent operations until the node is re-activated.
/// Orders carry a monotonic sequence number; stale orders are dropped.
#[derive(Debug, Default)]
pub struct NodeDeactivationState {
    fm: Mutex<ActivationState>,
    fmm: Mutex<ActivationState>,
}

/// Outcome of processing an activation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationDecision {
    /// The order applied and changed the activation flag.
    Changed,

    /// The order applied but the flag was already in that state.
    Unchanged,

    /// The order is stale (older sequence number) and was dropped.
    Stale,
}

impl NodeDeactivationState {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: FailoverManagerKind) -> &Mutex<ActivationState> {
        match kind {
            FailoverManagerKind::Fm => &self.fm,
            FailoverManagerKind::Fmm => &self.fmm,
        }
    }

    /// Applies an activation/deactivation order.
    pub fn process(&self, body: NodeActivationBody) -> ActivationDecision {
        let mut state = self
            .slot(body.kind)
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if body.sequence_number <= state.sequence_number {
            debug!(
                kind = %body.kind,
                incoming = body.sequence_number,
                current = state.sequence_number,
                "dropping stale activation order"
            );
            return ActivationDecision::Stale;
        }

        state.sequence_number = body.sequence_number;
        if state.is_activated == body.activate {
            return ActivationDecision::Unchanged;
        }
        state.is_activated = body.activate;
        info!(kind = %body.kind, activated = body.activate, "node activation changed");
        ActivationDecision::Changed
    }

    pub fn is_activated(&self, kind: FailoverManagerKind) -> bool {
        self.slot(kind)
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_activated
    }

    pub fn sequence_number(&self, kind: FailoverManagerKind) -> i64 {
        self.slot(kind)
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .sequence_number
    }
}

// ============================================================================
// FM message throttle
// ============================================================================

/// Caps the number of replicas packed into one outgoing FM batch.
#[derive(Debug, Clone, Copy)]
pub struct FmMessageThrottle {
    max_per_message: usize,
}

impl FmMessageThrottle {
    pub fn new(max_per_message: usize) -> Self {
        Self {
            max_per_message: max_per_message.max(1),
        }
    }

    pub fn cap(&self) -> usize {
        self.max_per_message
    }
}

impl Default for FmMessageThrottle {
    fn default() -> Self {
        Self::new(64)
    }
}

// ============================================================================
// Pending replica upload
// ============================================================================

/// The set of failover units whose `ReplicaUp` has not been acknowledged.
///
/// After node up the agent must report every local replica to the FM. The
/// report goes out in bounded bursts (one per retry interval); once the
/// set drains, the final burst carries the `is_last` marker
/// (`LastReplicaUp`).
#[derive(Debug, Default)]
pub struct PendingReplicaUploadState {
    state: Mutex<UploadState>,
}

#[derive(Debug, Default)]
struct UploadState {
    pending: BTreeSet<FailoverUnitId>,

    /// Set once the terminal empty batch has been acknowledged.
    completed: bool,
}

impl PendingReplicaUploadState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the backlog at node up.
    pub fn seed(&self, fts: impl IntoIterator<Item = FailoverUnitId>) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.pending.extend(fts);
        state.completed = false;
    }

    /// Builds the next bounded batch. `is_last` is set when nothing is
    /// pending, signalling `LastReplicaUp`.
    pub fn next_batch(&self, throttle: FmMessageThrottle) -> (Vec<FailoverUnitId>, bool) {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let batch: Vec<FailoverUnitId> =
            state.pending.iter().take(throttle.cap()).copied().collect();
        let is_last = batch.is_empty();
        (batch, is_last)
    }

    /// Processes the FM's acknowledgement of a batch.
    pub fn acknowledge(&self, fts: &[FailoverUnitId], was_last: bool) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for ft in fts {
            state.pending.remove(ft);
        }
        if was_last && state.pending.is_empty() {
            state.completed = true;
        }
    }

    pub fn has_pending(&self) -> bool {
        !self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pending
            .is_empty()
    }

    /// True once `LastReplicaUp` has been acknowledged.
    pub fn is_complete(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(kind: FailoverManagerKind, seq: i64, activate: bool) -> NodeActivationBody {
        NodeActivationBody {
            kind,
            sequence_number: seq,
            activate,
        }
    }

    #[test]
    fn activation_orders_are_monotonic() {
        let state = NodeDeactivationState::new();

        assert_eq!(
            state.process(order(FailoverManagerKind::Fm, 1, false)),
            ActivationDecision::Changed
        );
        assert!(!state.is_activated(FailoverManagerKind::Fm));

        // Stale re-activation is dropped.
        assert_eq!(
            state.process(order(FailoverManagerKind::Fm, 0, true)),
            ActivationDecision::Stale
        );
        assert!(!state.is_activated(FailoverManagerKind::Fm));

        assert_eq!(
            state.process(order(FailoverManagerKind::Fm, 2, true)),
            ActivationDecision::Changed
        );
        assert!(state.is_activated(FailoverManagerKind::Fm));
    }

    #[test]
    fn fm_kinds_are_independent() {
        let state = NodeDeactivationState::new();
        state.process(order(FailoverManagerKind::Fm, 1, false));
        assert!(state.is_activated(FailoverManagerKind::Fmm));
    }

    #[test]
    fn upload_drains_in_bounded_batches() {
        let upload = PendingReplicaUploadState::new();
        let fts: Vec<FailoverUnitId> = (0..5).map(|_| FailoverUnitId::generate()).collect();
        upload.seed(fts.clone());

        let throttle = FmMessageThrottle::new(2);

        let (batch, is_last) = upload.next_batch(throttle);
        assert_eq!(batch.len(), 2);
        assert!(!is_last);
        upload.acknowledge(&batch, false);

        let (batch, _) = upload.next_batch(throttle);
        assert_eq!(batch.len(), 2);
        upload.acknowledge(&batch, false);

        let (batch, _) = upload.next_batch(throttle);
        assert_eq!(batch.len(), 1);
        upload.acknowledge(&batch, false);

        // Drained: the next batch is the terminal LastReplicaUp marker.
        let (batch, is_last) = upload.next_batch(throttle);
        assert!(batch.is_empty());
        assert!(is_last);
        assert!(!upload.is_complete());

        upload.acknowledge(&[], true);
        assert!(upload.is_complete());
    }
}
