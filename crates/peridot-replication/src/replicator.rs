//! The replication fabric seam.
//!
//! The wire protocol is external to this crate: it is assumed to provide
//! ordered delivery and quorum acknowledgement. [`Replicator`] is the
//! interface the replicated store drives on the primary;
//! [`SecondaryPump`] is the ordered operation source a secondary drains.
//!
//! [`ChannelReplicator`] is the in-process fabric used by embedded clusters
//! and tests: it assigns LSNs, enqueues operations to every registered
//! secondary endpoint in order, and acknowledges once a quorum of endpoints
//! is connected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use peridot_types::{Lsn, Timestamp};
use tracing::debug;

use crate::notification::RowChange;
use crate::ReplicationError;

/// One replicated operation: the changes of a single committed transaction.
#[derive(Debug, Clone)]
pub struct ReplicationOperation {
    pub lsn: Lsn,
    pub changes: Vec<RowChange>,

    /// Primary wall-clock time of the commit, preserved on secondaries.
    pub primary_utc: Timestamp,
}

impl ReplicationOperation {
    pub fn size_bytes(&self) -> u64 {
        self.changes.iter().map(RowChange::size_bytes).sum()
    }
}

/// The primary-side replication interface.
pub trait Replicator: Send + Sync {
    /// Replicates one transaction's changes.
    ///
    /// Assigns the operation LSN and returns it once a write quorum has
    /// acknowledged. The assigned LSNs are strictly increasing.
    fn replicate(
        &self,
        changes: Vec<RowChange>,
        primary_utc: Timestamp,
        timeout: Duration,
    ) -> Result<Lsn, ReplicationError>;

    /// Current replication queue depth and byte size (throttle input).
    fn queue_status(&self) -> (usize, u64);
}

// ============================================================================
// Channel replicator (in-process fabric)
// ============================================================================

/// A secondary's endpoint in the in-process fabric.
///
/// Operations enqueue in LSN order; `connected` controls whether the
/// endpoint counts toward the write quorum.
pub struct SecondaryEndpoint {
    queue: SegQueue<ReplicationOperation>,
    connected: AtomicBool,
}

impl SecondaryEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: SegQueue::new(),
            connected: AtomicBool::new(true),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl Default for SecondaryEndpoint {
    fn default() -> Self {
        Self {
            queue: SegQueue::new(),
            connected: AtomicBool::new(true),
        }
    }
}

/// The ordered operation source a secondary drains.
pub struct SecondaryPump {
    endpoint: Arc<SecondaryEndpoint>,
}

impl SecondaryPump {
    pub fn new(endpoint: Arc<SecondaryEndpoint>) -> Self {
        Self { endpoint }
    }

    /// Pops the next replication operation, if any.
    pub fn try_next(&self) -> Option<ReplicationOperation> {
        self.endpoint.queue.pop()
    }

    pub fn pending(&self) -> usize {
        self.endpoint.queue.len()
    }
}

struct ChannelState {
    last_assigned: Lsn,
    secondaries: Vec<Arc<SecondaryEndpoint>>,
}

/// In-process replication fabric with ordered delivery and quorum ack.
pub struct ChannelReplicator {
    state: Mutex<ChannelState>,

    /// Total replica-set size used for the quorum computation (the primary
    /// counts as one member).
    replica_set_size: usize,
}

impl ChannelReplicator {
    pub fn new(replica_set_size: usize) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                last_assigned: Lsn::ZERO,
                secondaries: Vec::new(),
            }),
            replica_set_size: replica_set_size.max(1),
        }
    }

    /// Registers a secondary endpoint and returns its pump.
    pub fn register_secondary(&self) -> (Arc<SecondaryEndpoint>, SecondaryPump) {
        let endpoint = SecondaryEndpoint::new();
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .secondaries
            .push(endpoint.clone());
        (endpoint.clone(), SecondaryPump::new(endpoint))
    }

    /// Seeds the LSN sequence (used after restore or rebuild).
    pub fn reset_lsn(&self, lsn: Lsn) {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .last_assigned = lsn;
    }

    fn quorum_size(&self) -> usize {
        self.replica_set_size / 2 + 1
    }
}

impl Replicator for ChannelReplicator {
    fn replicate(
        &self,
        changes: Vec<RowChange>,
        primary_utc: Timestamp,
        timeout: Duration,
    ) -> Result<Lsn, ReplicationError> {
        let _ = timeout;
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // The primary's own durable apply counts as one ack.
        let acks = 1 + state
            .secondaries
            .iter()
            .filter(|s| s.is_connected())
            .count();
        if acks < self.quorum_size() {
            return Err(ReplicationError::NoWriteQuorum);
        }

        let lsn = state.last_assigned.next();
        state.last_assigned = lsn;

        let operation = ReplicationOperation {
            lsn,
            changes,
            primary_utc,
        };
        for secondary in &state.secondaries {
            if secondary.is_connected() {
                secondary.queue.push(operation.clone());
            }
        }

        debug!(%lsn, changes = operation.changes.len(), "replicated operation quorum-acked");
        Ok(lsn)
    }

    fn queue_status(&self) -> (usize, u64) {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let depth: usize = state.secondaries.iter().map(|s| s.queued()).sum();
        // Byte accounting is approximated by depth; endpoints drain quickly
        // in process so the operation-count watermark dominates.
        (depth, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::notification::ChangeKind;

    fn change(key: &str) -> RowChange {
        RowChange {
            kind: ChangeKind::Insert,
            row_type: "T".to_string(),
            key: key.to_string(),
            value: Bytes::from_static(b"v"),
        }
    }

    #[test]
    fn assigns_increasing_lsns() {
        let replicator = ChannelReplicator::new(1);
        let l1 = replicator
            .replicate(vec![change("a")], Timestamp::now(), Duration::ZERO)
            .unwrap();
        let l2 = replicator
            .replicate(vec![change("b")], Timestamp::now(), Duration::ZERO)
            .unwrap();
        assert_eq!(l1, Lsn::new(1));
        assert_eq!(l2, Lsn::new(2));
    }

    #[test]
    fn delivers_in_order_to_all_secondaries() {
        let replicator = ChannelReplicator::new(3);
        let (_e1, pump1) = replicator.register_secondary();
        let (_e2, pump2) = replicator.register_secondary();

        for key in ["a", "b", "c"] {
            replicator
                .replicate(vec![change(key)], Timestamp::now(), Duration::ZERO)
                .unwrap();
        }

        for pump in [pump1, pump2] {
            let lsns: Vec<i64> = std::iter::from_fn(|| pump.try_next())
                .map(|op| op.lsn.as_i64())
                .collect();
            assert_eq!(lsns, vec![1, 2, 3]);
        }
    }

    #[test]
    fn lost_quorum_rejects_writes() {
        let replicator = ChannelReplicator::new(3);
        let (e1, _p1) = replicator.register_secondary();
        let (e2, _p2) = replicator.register_secondary();

        e1.set_connected(false);
        e2.set_connected(false);

        let err = replicator
            .replicate(vec![change("a")], Timestamp::now(), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, ReplicationError::NoWriteQuorum));
    }
}
