//! Replicated transactions.
//!
//! A replicated transaction collects row mutations on the primary; the LSN
//! is deferred until [`crate::ReplicatedStore::begin_commit`] replicates the
//! changes and quorum acknowledgement assigns it.
//!
//! A **simple** transaction is one the caller asserts is commutative with
//! other simple transactions against the same replica. The store may
//! batch-commit simple transactions inside the commit-batching window;
//! breaking the commutativity assertion is surfaced as a contract violation,
//! never silent corruption.

use peridot_types::ActivityId;
use peridot_store::Transaction;

use crate::notification::RowChange;

/// Which flavor of replicated transaction this is.
#[derive(Debug)]
pub(crate) enum TxKind {
    /// Ordinary transaction holding engine locks from the first operation.
    User { inner: Transaction },

    /// Commutative transaction; engine work is deferred to the batch flush.
    Simple,
}

/// A transaction against the replicated store.
#[derive(Debug)]
pub struct ReplicatedTransaction {
    pub(crate) activity_id: ActivityId,
    pub(crate) kind: TxKind,
    pub(crate) changes: Vec<RowChange>,
}

impl ReplicatedTransaction {
    pub(crate) fn user(activity_id: ActivityId, inner: Transaction) -> Self {
        Self {
            activity_id,
            kind: TxKind::User { inner },
            changes: Vec::new(),
        }
    }

    pub(crate) fn simple(activity_id: ActivityId) -> Self {
        Self {
            activity_id,
            kind: TxKind::Simple,
            changes: Vec::new(),
        }
    }

    pub fn activity_id(&self) -> ActivityId {
        self.activity_id
    }

    pub fn is_simple(&self) -> bool {
        matches!(self.kind, TxKind::Simple)
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }
}
