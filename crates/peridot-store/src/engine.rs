//! The local store engine contract.
//!
//! [`LocalStore`] is the pluggable engine interface: row-level CRUD with
//! optimistic concurrency, LSN-ordered enumeration for copy streams, durable
//! commit, and backup/restore. The replicated store layer is written against
//! this trait so engines can be swapped (and migrated between) without
//! touching replication.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use peridot_types::{Lsn, Timestamp};

use crate::backup::BackupMode;
use crate::row::{Row, RowKey};
use crate::StoreError;

// ============================================================================
// Transactions
// ============================================================================

/// Transaction isolation levels supported by the engine contract.
///
/// An engine may reject a level it does not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// Reads observe the latest committed value per row.
    ReadCommitted,

    /// Reads observe a stable snapshot taken at transaction start.
    Serializable,
}

/// Lifecycle of a transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committing,
    Committed,
    RolledBack,

    /// Aborted by the engine (failure or replica demotion).
    Aborted,
}

/// A pending write accumulated in a transaction.
#[derive(Debug, Clone)]
pub(crate) enum PendingWrite {
    Insert {
        row: Row,
        explicit_lsn: Option<Lsn>,
    },
    Update {
        original_key: RowKey,
        row: Row,
        explicit_lsn: Option<Lsn>,
    },
    Delete {
        key: RowKey,
    },
}

impl PendingWrite {
    pub(crate) fn target_key(&self) -> RowKey {
        match self {
            PendingWrite::Insert { row, .. } | PendingWrite::Update { row, .. } => row.row_key(),
            PendingWrite::Delete { key } => key.clone(),
        }
    }
}

/// A transaction handle.
///
/// Handles are created by [`LocalStore::begin_transaction`] and passed by
/// the caller to every operation. All validation happens inside the engine;
/// the handle only carries the accumulated write set and, for serializable
/// transactions, the read snapshot.
#[derive(Debug)]
pub struct Transaction {
    pub(crate) id: u64,
    pub(crate) isolation: Isolation,
    pub(crate) state: TxState,
    pub(crate) snapshot: Option<BTreeMap<RowKey, Row>>,
    pub(crate) writes: Vec<PendingWrite>,

    /// Timestamp to stamp as primary modification time; `None` means local
    /// wall clock (set by the replicated store when applying on a secondary).
    pub(crate) primary_utc_override: Option<Timestamp>,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TxState::Active
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Overrides the primary modification timestamp for rows committed by
    /// this transaction. Used when replaying replicated or copied operations
    /// so secondaries preserve the primary's time.
    pub fn set_primary_utc(&mut self, utc: Timestamp) {
        self.primary_utc_override = Some(utc);
    }
}

// ============================================================================
// Cursors
// ============================================================================

/// A cursor over a materialized set of rows.
///
/// Enumerations observe a stable view taken at cursor creation.
#[derive(Debug)]
pub struct RowCursor {
    rows: VecDeque<Row>,
}

impl RowCursor {
    pub(crate) fn new(rows: Vec<Row>) -> Self {
        Self { rows: rows.into() }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Iterator for RowCursor {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }
}

// ============================================================================
// Engine contract
// ============================================================================

/// The engine contract: every operation takes a transaction handle.
///
/// # Guarantees
///
/// - Writes are durable on successful [`commit`](LocalStore::commit).
/// - The LSN assigned at commit is unique and strictly increasing per
///   replica.
/// - Enumeration observes a stable snapshot for the duration of the cursor.
/// - Concurrent transactions on distinct keys do not block each other;
///   conflicting writers are aborted with `DeadlockDetected` (retryable).
pub trait LocalStore: Send + Sync {
    /// Begins a transaction at the given isolation level.
    fn begin_transaction(&self, isolation: Isolation) -> Result<Transaction, StoreError>;

    /// Inserts a new row. Fails with `KeyExists` if `(type, key)` is present.
    ///
    /// `lsn` pins the row's operation LSN (replication apply); `None` defers
    /// to the LSN assigned at commit.
    fn insert(
        &self,
        tx: &mut Transaction,
        row_type: &str,
        key: &str,
        value: Bytes,
        lsn: Option<Lsn>,
    ) -> Result<(), StoreError>;

    /// Updates an existing row, optionally renaming it to `new_key`.
    ///
    /// If `check_lsn` is set, the update only proceeds when the row's current
    /// LSN matches exactly; otherwise `WriteConflict` is returned.
    fn update(
        &self,
        tx: &mut Transaction,
        row_type: &str,
        key: &str,
        check_lsn: Option<Lsn>,
        new_key: Option<&str>,
        new_value: Bytes,
        lsn: Option<Lsn>,
    ) -> Result<(), StoreError>;

    /// Deletes an existing row, with the same conflict rules as update.
    fn delete(
        &self,
        tx: &mut Transaction,
        row_type: &str,
        key: &str,
        check_lsn: Option<Lsn>,
    ) -> Result<(), StoreError>;

    /// Returns the operation LSN of a row, or `NotFound`.
    fn get_operation_lsn(
        &self,
        tx: &Transaction,
        row_type: &str,
        key: &str,
    ) -> Result<Lsn, StoreError>;

    /// Re-stamps the LSN of a pending write in this transaction.
    ///
    /// The replicated store calls this after quorum acknowledgement assigns
    /// the final LSN and before the local commit is issued.
    fn update_operation_lsn(
        &self,
        tx: &mut Transaction,
        row_type: &str,
        key: &str,
        lsn: Lsn,
    ) -> Result<(), StoreError>;

    /// Reads a single row by exact `(type, key)`.
    fn read_exact(&self, tx: &Transaction, row_type: &str, key: &str) -> Result<Row, StoreError>;

    /// Enumerates rows of `row_type` with `key >= key_start`, sorted by key.
    fn enumerate_by_type_and_key(
        &self,
        tx: &Transaction,
        row_type: &str,
        key_start: &str,
    ) -> Result<RowCursor, StoreError>;

    /// Enumerates rows with `operation_lsn > from_lsn` in LSN order.
    ///
    /// This is the copy-stream source: the cursor observes a stable snapshot
    /// taken at creation.
    fn enumerate_by_operation_lsn(
        &self,
        tx: &Transaction,
        from_lsn: Lsn,
    ) -> Result<RowCursor, StoreError>;

    /// Returns the highest commit LSN of the store.
    fn get_last_change_lsn(&self, tx: &Transaction) -> Result<Lsn, StoreError>;

    /// Replaces the entire store content with `rows` at `last_lsn`.
    ///
    /// Used by rebuild copy and restore: the previous content and LSN
    /// sequence are discarded. Durable on return.
    fn install_image(&self, rows: Vec<Row>, last_lsn: Lsn) -> Result<(), StoreError>;

    /// Physically removes rows without advancing the LSN sequence.
    ///
    /// Garbage collection only (tombstone cleanup): the removal is durable
    /// but does not consume an LSN, so per-replica GC cannot desynchronize
    /// the replicated commit sequence. Missing keys are skipped. Returns the
    /// number of rows removed.
    fn purge(&self, keys: &[RowKey]) -> Result<usize, StoreError>;

    /// Commits the transaction; durable on success. Returns the commit LSN.
    fn commit(&self, tx: &mut Transaction, timeout: Duration) -> Result<Lsn, StoreError>;

    /// Rolls back the transaction, releasing its locks.
    fn rollback(&self, tx: &mut Transaction);

    /// Backs up the store to `dir`.
    fn backup(&self, dir: &Path, mode: BackupMode) -> Result<(), StoreError>;

    /// Restores the store from a (merged) backup directory, replacing all
    /// current content.
    fn restore(&self, dir: &Path) -> Result<(), StoreError>;

    /// Merges a backup chain (one full plus zero or more incrementals, in
    /// chain order) into a single restorable directory.
    fn merge_backup_chain(
        &self,
        chain_dirs: &[std::path::PathBuf],
        merged_dir: &Path,
    ) -> Result<(), StoreError>;

    fn is_incremental_backup_enabled(&self) -> bool;

    /// True when the engine wants the replicated store to schedule log
    /// truncation (incremental backup keeps segments alive).
    fn is_log_truncation_required(&self) -> bool;

    /// Writes a checkpoint and truncates covered log segments.
    fn truncate_logs(&self) -> Result<(), StoreError>;

    fn estimate_row_count(&self) -> Result<usize, StoreError>;

    fn estimate_db_size_bytes(&self) -> Result<u64, StoreError>;

    /// Closes the store. Subsequent operations fail with `ObjectClosed`.
    fn close(&self) -> Result<(), StoreError>;
}
