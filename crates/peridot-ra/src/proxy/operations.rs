//! The set of currently executing proxy operations.
//!
//! Operations are indexed by action list; single-instance lists (change
//! role, catch-up) hold one slot, multi-instance lists (build idle) hold
//! one slot per remote replica. An incoming list is admitted only if it is
//! compatible with every executing one.

use std::collections::HashSet;
use std::sync::Mutex;

use peridot_types::ReplicaId;

use super::action_list::{ProxyActionsList, can_run_concurrently};

/// Identity of one executing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutingOperation {
    pub list: ProxyActionsList,

    /// Set for multi-instance lists.
    pub replica: Option<ReplicaId>,
}

/// Why an operation was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    /// An incompatible list is executing.
    Incompatible(ProxyActionsList),

    /// The same operation (same list, same replica for multi-instance) is
    /// already executing.
    AlreadyExecuting,
}

/// Tracks executing operations and admits new ones.
#[derive(Debug, Default)]
pub struct ExecutingOperationList {
    executing: Mutex<HashSet<ExecutingOperation>>,
}

impl ExecutingOperationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries to admit `list` (for `replica` when multi-instance).
    pub fn try_begin(
        &self,
        list: ProxyActionsList,
        replica: Option<ReplicaId>,
    ) -> Result<ExecutingOperation, AdmissionError> {
        debug_assert_eq!(
            list.is_multi_instance(),
            replica.is_some(),
            "multi-instance lists take a replica, single-instance lists do not"
        );

        let op = ExecutingOperation { list, replica };
        let mut executing = self
            .executing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if executing.contains(&op) {
            return Err(AdmissionError::AlreadyExecuting);
        }
        for existing in executing.iter() {
            if !can_run_concurrently(existing.list, list) {
                return Err(AdmissionError::Incompatible(existing.list));
            }
        }

        executing.insert(op);
        Ok(op)
    }

    /// Marks an admitted operation finished.
    pub fn end(&self, op: ExecutingOperation) {
        self.executing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&op);
    }

    pub fn executing_count(&self) -> usize {
        self.executing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incompatible_lists_are_rejected() {
        let ops = ExecutingOperationList::new();
        let catchup = ops
            .try_begin(ProxyActionsList::ReplicatorUpdateAndCatchupQuorum, None)
            .unwrap();

        let err = ops
            .try_begin(ProxyActionsList::StatefulServiceChangeRole, None)
            .unwrap_err();
        assert_eq!(
            err,
            AdmissionError::Incompatible(ProxyActionsList::ReplicatorUpdateAndCatchupQuorum)
        );

        ops.end(catchup);
        assert!(ops
            .try_begin(ProxyActionsList::StatefulServiceChangeRole, None)
            .is_ok());
    }

    #[test]
    fn builds_for_different_replicas_run_concurrently() {
        let ops = ExecutingOperationList::new();
        ops.try_begin(
            ProxyActionsList::ReplicatorBuildIdleReplica,
            Some(ReplicaId::new(1)),
        )
        .unwrap();
        ops.try_begin(
            ProxyActionsList::ReplicatorBuildIdleReplica,
            Some(ReplicaId::new(2)),
        )
        .unwrap();
        assert_eq!(ops.executing_count(), 2);

        // The same replica's build is single-flight.
        let err = ops
            .try_begin(
                ProxyActionsList::ReplicatorBuildIdleReplica,
                Some(ReplicaId::new(1)),
            )
            .unwrap_err();
        assert_eq!(err, AdmissionError::AlreadyExecuting);
    }

    #[test]
    fn queries_pass_through_long_builds() {
        let ops = ExecutingOperationList::new();
        ops.try_begin(
            ProxyActionsList::ReplicatorBuildIdleReplica,
            Some(ReplicaId::new(1)),
        )
        .unwrap();

        let query = ops.try_begin(ProxyActionsList::Query, None).unwrap();
        ops.end(query);
    }
}
