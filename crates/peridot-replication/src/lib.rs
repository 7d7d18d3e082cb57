//! Replicated store layer for Peridot.
//!
//! This crate wraps a local [`peridot_store::LocalStore`] with the
//! primary/secondary replication protocol:
//!
//! - On the primary, transactions collect row mutations, replicate them,
//!   and commit locally only after quorum acknowledgement
//!   ([`ReplicatedStore::begin_commit`])
//! - On secondaries, replication operations apply in strict LSN order; a
//!   gap is fatal because the replicator guarantees contiguity
//! - Joining secondaries catch up through copy streams ([`copy`])
//! - Commit and data-loss notifications dispatch to subscribers in LSN
//!   order ([`notification`])
//! - Deleted rows leave tombstones that serve copy streams until cleanup
//!   decides no live cursor can still observe them ([`ReplicatedStore::cleanup_tombstones`])
//! - Backups and restores run through the engine's chain support
//! - An optional migrator moves a service between engines while the source
//!   stays authoritative ([`migration`])
//!
//! The replication wire fabric itself is external: [`Replicator`] is the
//! seam, and [`replicator::ChannelReplicator`] provides ordered delivery
//! with quorum acknowledgement for in-process clusters and tests.

mod copy;
mod notification;
mod replicator;
mod settings;
mod store;
mod throttle;
mod transaction;

pub mod migration;

pub use copy::{CopyContext, CopyMode, CopyStats};
pub use notification::{
    ChangeKind, ChangeNotification, RowChange, SecondaryNotificationMode, StoreSubscriber,
};
pub use replicator::{
    ChannelReplicator, ReplicationOperation, Replicator, SecondaryEndpoint, SecondaryPump,
};
pub use settings::{FullCopyMode, ReplicatedStoreSettings};
pub use store::{CommitOutcome, QueryStatus, ReplicatedStore, WriteStatus};
pub use throttle::{ReplicationThrottle, ThrottleCallback};
pub use transaction::ReplicatedTransaction;

use peridot_types::Lsn;
use thiserror::Error;

/// Errors surfaced by the replicated store.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The operation requires the primary role.
    #[error("replica is not primary")]
    NotPrimary,

    /// Writes are gated while a reconfiguration is in flight.
    #[error("reconfiguration pending")]
    ReconfigurationPending,

    /// Quorum is unavailable; writes cannot be acknowledged.
    #[error("no write quorum")]
    NoWriteQuorum,

    #[error("replicated store is closed")]
    ObjectClosed,

    /// Replication queue is over its configured limits.
    #[error("replication quota exceeded")]
    QuotaExceeded,

    #[error("operation timed out")]
    Timeout,

    /// A gap in the replication stream; the replicator contract is broken
    /// and the replica must be rebuilt.
    #[error("lsn gap on apply: expected {expected}, got {actual}")]
    LsnGap { expected: Lsn, actual: Lsn },

    /// Unrecoverable loss of state; requires the data-loss handler or
    /// operator action.
    #[error("data loss reported")]
    DataLoss,

    /// A commutativity or usage contract was broken by the caller.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("migration failed in {phase}: {reason}")]
    MigrationFailed { phase: &'static str, reason: String },

    #[error(transparent)]
    Store(#[from] peridot_store::StoreError),
}

impl ReplicationError {
    /// Classifies this error for the retry and escalation machinery.
    pub fn classify(&self) -> peridot_types::ErrorClass {
        use peridot_types::ErrorClass;
        match self {
            ReplicationError::NotPrimary
            | ReplicationError::ReconfigurationPending
            | ReplicationError::NoWriteQuorum
            | ReplicationError::QuotaExceeded
            | ReplicationError::ObjectClosed
            | ReplicationError::Timeout => ErrorClass::Retryable,
            ReplicationError::LsnGap { .. }
            | ReplicationError::DataLoss
            | ReplicationError::ContractViolation(_) => ErrorClass::Fatal,
            ReplicationError::MigrationFailed { .. } => ErrorClass::Informational,
            ReplicationError::Store(e) => e.classify(),
        }
    }

    /// True if the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        self.classify() == peridot_types::ErrorClass::Retryable
    }
}

/// Row type reserved for tombstones.
pub(crate) const TOMBSTONE_ROW_TYPE: &str = "__tombstone";

/// Separator between the original row type and key inside a tombstone key.
pub(crate) const TOMBSTONE_KEY_SEPARATOR: char = '\u{1}';

pub(crate) fn tombstone_key(row_type: &str, key: &str) -> String {
    format!("{row_type}{TOMBSTONE_KEY_SEPARATOR}{key}")
}

pub(crate) fn split_tombstone_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(TOMBSTONE_KEY_SEPARATOR)
}

#[cfg(test)]
mod tests;
