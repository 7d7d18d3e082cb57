//! Log-structured implementation of the [`LocalStore`] contract.
//!
//! State lives in an in-memory row map plus an LSN index; durability comes
//! from the commit log (see [`crate::log`]). Conflicting concurrent writers
//! are aborted immediately (`DeadlockDetected`) instead of queued, so lock
//! waits cannot cycle.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use peridot_types::{Lsn, Timestamp};
use tracing::{debug, warn};

use crate::backup::{self, BackupMode};
use crate::engine::{Isolation, LocalStore, PendingWrite, RowCursor, Transaction, TxState};
use crate::log::{CommitLog, CommitRecord, RecordOp};
use crate::row::{Row, RowKey};
use crate::settings::LocalStoreSettings;
use crate::StoreError;

pub(crate) struct Inner {
    pub(crate) open: bool,
    pub(crate) rows: BTreeMap<RowKey, Row>,
    pub(crate) lsn_index: BTreeMap<Lsn, Vec<RowKey>>,
    pub(crate) last_commit_lsn: Lsn,
    pub(crate) log: CommitLog,
    next_tx_id: u64,
    active_tx_count: usize,

    /// Row write locks held by active transactions, keyed by row.
    locks: HashMap<RowKey, u64>,
}

impl Inner {
    pub(crate) fn index_put(&mut self, row: Row) {
        let key = row.row_key();
        if let Some(old) = self.rows.get(&key) {
            Self::index_remove(&mut self.lsn_index, old.operation_lsn, &key);
        }
        self.lsn_index
            .entry(row.operation_lsn)
            .or_default()
            .push(key.clone());
        self.rows.insert(key, row);
    }

    pub(crate) fn index_delete(&mut self, key: &RowKey) {
        if let Some(old) = self.rows.remove(key) {
            Self::index_remove(&mut self.lsn_index, old.operation_lsn, key);
        }
    }

    fn index_remove(lsn_index: &mut BTreeMap<Lsn, Vec<RowKey>>, lsn: Lsn, key: &RowKey) {
        if let Some(keys) = lsn_index.get_mut(&lsn) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                lsn_index.remove(&lsn);
            }
        }
    }

    pub(crate) fn apply_record(&mut self, record: &CommitRecord) {
        for op in &record.ops {
            match op {
                RecordOp::Put(row) => self.index_put(row.clone()),
                RecordOp::Delete { key, .. } => self.index_delete(key),
            }
        }
        self.last_commit_lsn = self.last_commit_lsn.max(record.lsn);
    }

    fn release_tx(&mut self, tx_id: u64) {
        self.locks.retain(|_, holder| *holder != tx_id);
        self.active_tx_count = self.active_tx_count.saturating_sub(1);
    }

    fn lock_key(&mut self, tx_id: u64, key: &RowKey) -> Result<(), StoreError> {
        match self.locks.get(key) {
            Some(holder) if *holder != tx_id => Err(StoreError::DeadlockDetected {
                row_type: key.row_type.clone(),
                key: key.key.clone(),
            }),
            _ => {
                self.locks.insert(key.clone(), tx_id);
                Ok(())
            }
        }
    }
}

/// Resolves the row visible to `tx` for `key`: the isolation-appropriate
/// committed view with the transaction's own pending writes applied on top.
fn effective_row(inner: &Inner, tx: &Transaction, key: &RowKey) -> Option<Row> {
    let base = match (&tx.snapshot, tx.isolation) {
        (Some(snapshot), Isolation::Serializable) => snapshot.get(key).cloned(),
        _ => inner.rows.get(key).cloned(),
    };

    let mut current = base;
    for write in &tx.writes {
        match write {
            PendingWrite::Insert { row, .. } if row.row_key() == *key => {
                current = Some(row.clone());
            }
            PendingWrite::Update {
                original_key, row, ..
            } => {
                if *original_key == *key && row.row_key() != *key {
                    current = None;
                } else if row.row_key() == *key {
                    current = Some(row.clone());
                }
            }
            PendingWrite::Delete { key: deleted } if *deleted == *key => {
                current = None;
            }
            _ => {}
        }
    }
    current
}

/// Materializes the full row view for `tx` (committed view plus pending
/// writes), used by the enumerations.
fn effective_view(inner: &Inner, tx: &Transaction) -> BTreeMap<RowKey, Row> {
    let mut view = match (&tx.snapshot, tx.isolation) {
        (Some(snapshot), Isolation::Serializable) => snapshot.clone(),
        _ => inner.rows.clone(),
    };

    for write in &tx.writes {
        match write {
            PendingWrite::Insert { row, .. } => {
                view.insert(row.row_key(), row.clone());
            }
            PendingWrite::Update {
                original_key, row, ..
            } => {
                if *original_key != row.row_key() {
                    view.remove(original_key);
                }
                view.insert(row.row_key(), row.clone());
            }
            PendingWrite::Delete { key } => {
                view.remove(key);
            }
        }
    }
    view
}

/// The log-structured key-value engine.
pub struct LogKvStore {
    inner: Mutex<Inner>,
    settings: LocalStoreSettings,
}

impl LogKvStore {
    /// Opens (or creates) a store under the settings' database directory.
    pub fn open(settings: LocalStoreSettings) -> Result<Self, StoreError> {
        let dir = settings.database_directory.clone();
        let (log, checkpoint, records) =
            CommitLog::open(&dir, settings.log_file_size_kb.saturating_mul(1024))?;

        let mut inner = Inner {
            open: true,
            rows: BTreeMap::new(),
            lsn_index: BTreeMap::new(),
            last_commit_lsn: Lsn::ZERO,
            log,
            next_tx_id: 1,
            active_tx_count: 0,
            locks: HashMap::new(),
        };

        if let Some(checkpoint) = checkpoint {
            inner.last_commit_lsn = checkpoint.last_lsn;
            for row in checkpoint.rows {
                inner.index_put(row);
            }
        }
        for record in &records {
            inner.apply_record(record);
        }

        debug!(
            dir = %dir.display(),
            rows = inner.rows.len(),
            last_lsn = %inner.last_commit_lsn,
            replayed = records.len(),
            "opened local store"
        );

        Ok(Self {
            inner: Mutex::new(inner),
            settings,
        })
    }

    pub fn settings(&self) -> &LocalStoreSettings {
        &self.settings
    }

    pub fn database_directory(&self) -> &PathBuf {
        &self.settings.database_directory
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn guard_open(inner: &Inner) -> Result<(), StoreError> {
        if inner.open {
            Ok(())
        } else {
            Err(StoreError::ObjectClosed)
        }
    }

    fn guard_active(tx: &Transaction) -> Result<(), StoreError> {
        if tx.is_active() {
            Ok(())
        } else {
            Err(StoreError::TransactionNotActive)
        }
    }
}

impl LocalStore for LogKvStore {
    fn begin_transaction(&self, isolation: Isolation) -> Result<Transaction, StoreError> {
        let mut inner = self.lock_inner();
        Self::guard_open(&inner)?;

        // Cursor snapshots are materialized, so the cursor budget bounds
        // concurrent transactions instead of open cursor handles.
        if inner.active_tx_count >= self.settings.max_cursors {
            return Err(StoreError::StoreBusy("transaction limit reached"));
        }

        let id = inner.next_tx_id;
        inner.next_tx_id += 1;
        inner.active_tx_count += 1;

        let snapshot = match isolation {
            Isolation::Serializable => Some(inner.rows.clone()),
            Isolation::ReadCommitted => None,
        };

        Ok(Transaction {
            id,
            isolation,
            state: TxState::Active,
            snapshot,
            writes: Vec::new(),
            primary_utc_override: None,
        })
    }

    fn insert(
        &self,
        tx: &mut Transaction,
        row_type: &str,
        key: &str,
        value: Bytes,
        lsn: Option<Lsn>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        Self::guard_open(&inner)?;
        Self::guard_active(tx)?;

        let row_key = RowKey::new(row_type, key);
        if effective_row(&inner, tx, &row_key).is_some() {
            return Err(StoreError::KeyExists {
                row_type: row_type.to_string(),
                key: key.to_string(),
            });
        }
        inner.lock_key(tx.id, &row_key)?;

        let mut row = Row::new(row_type, key, value);
        if let Some(lsn) = lsn {
            row.operation_lsn = lsn;
        }
        tx.writes.push(PendingWrite::Insert {
            row,
            explicit_lsn: lsn,
        });
        Ok(())
    }

    fn update(
        &self,
        tx: &mut Transaction,
        row_type: &str,
        key: &str,
        check_lsn: Option<Lsn>,
        new_key: Option<&str>,
        new_value: Bytes,
        lsn: Option<Lsn>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        Self::guard_open(&inner)?;
        Self::guard_active(tx)?;

        let row_key = RowKey::new(row_type, key);
        let existing = effective_row(&inner, tx, &row_key)
            .ok_or_else(|| StoreError::not_found(row_type, key))?;

        if let Some(expected) = check_lsn {
            if existing.operation_lsn != expected {
                return Err(StoreError::WriteConflict {
                    row_type: row_type.to_string(),
                    key: key.to_string(),
                    expected,
                    actual: existing.operation_lsn,
                });
            }
        }

        inner.lock_key(tx.id, &row_key)?;
        let target_key = new_key.unwrap_or(key);
        if target_key != key {
            inner.lock_key(tx.id, &RowKey::new(row_type, target_key))?;
        }

        let mut row = Row::new(row_type, target_key, new_value);
        row.last_modified_on_primary_utc = existing.last_modified_on_primary_utc;
        if let Some(lsn) = lsn {
            row.operation_lsn = lsn;
        }
        tx.writes.push(PendingWrite::Update {
            original_key: row_key,
            row,
            explicit_lsn: lsn,
        });
        Ok(())
    }

    fn delete(
        &self,
        tx: &mut Transaction,
        row_type: &str,
        key: &str,
        check_lsn: Option<Lsn>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        Self::guard_open(&inner)?;
        Self::guard_active(tx)?;

        let row_key = RowKey::new(row_type, key);
        let existing = effective_row(&inner, tx, &row_key)
            .ok_or_else(|| StoreError::not_found(row_type, key))?;

        if let Some(expected) = check_lsn {
            if existing.operation_lsn != expected {
                return Err(StoreError::WriteConflict {
                    row_type: row_type.to_string(),
                    key: key.to_string(),
                    expected,
                    actual: existing.operation_lsn,
                });
            }
        }

        inner.lock_key(tx.id, &row_key)?;
        tx.writes.push(PendingWrite::Delete { key: row_key });
        Ok(())
    }

    fn get_operation_lsn(
        &self,
        tx: &Transaction,
        row_type: &str,
        key: &str,
    ) -> Result<Lsn, StoreError> {
        let inner = self.lock_inner();
        Self::guard_open(&inner)?;

        effective_row(&inner, tx, &RowKey::new(row_type, key))
            .map(|row| row.operation_lsn)
            .ok_or_else(|| StoreError::not_found(row_type, key))
    }

    fn update_operation_lsn(
        &self,
        tx: &mut Transaction,
        row_type: &str,
        key: &str,
        lsn: Lsn,
    ) -> Result<(), StoreError> {
        Self::guard_active(tx)?;
        let row_key = RowKey::new(row_type, key);

        for write in tx.writes.iter_mut().rev() {
            match write {
                PendingWrite::Insert { row, explicit_lsn } if row.row_key() == row_key => {
                    row.operation_lsn = lsn;
                    *explicit_lsn = Some(lsn);
                    return Ok(());
                }
                PendingWrite::Update {
                    row, explicit_lsn, ..
                } if row.row_key() == row_key => {
                    row.operation_lsn = lsn;
                    *explicit_lsn = Some(lsn);
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(StoreError::not_found(row_type, key))
    }

    fn read_exact(&self, tx: &Transaction, row_type: &str, key: &str) -> Result<Row, StoreError> {
        let inner = self.lock_inner();
        Self::guard_open(&inner)?;

        effective_row(&inner, tx, &RowKey::new(row_type, key))
            .ok_or_else(|| StoreError::not_found(row_type, key))
    }

    fn enumerate_by_type_and_key(
        &self,
        tx: &Transaction,
        row_type: &str,
        key_start: &str,
    ) -> Result<RowCursor, StoreError> {
        let inner = self.lock_inner();
        Self::guard_open(&inner)?;

        let view = effective_view(&inner, tx);
        let start = RowKey::new(row_type, key_start);
        let end = RowKey::new(format!("{row_type}\u{0}"), "");

        let rows = view
            .range((Bound::Included(start), Bound::Excluded(end)))
            .map(|(_, row)| row.clone())
            .collect();
        Ok(RowCursor::new(rows))
    }

    fn enumerate_by_operation_lsn(
        &self,
        tx: &Transaction,
        from_lsn: Lsn,
    ) -> Result<RowCursor, StoreError> {
        let inner = self.lock_inner();
        Self::guard_open(&inner)?;
        let _ = tx;

        let mut rows = Vec::new();
        for (_, keys) in inner
            .lsn_index
            .range((Bound::Excluded(from_lsn), Bound::Unbounded))
        {
            for key in keys {
                if let Some(row) = inner.rows.get(key) {
                    rows.push(row.clone());
                }
            }
        }
        Ok(RowCursor::new(rows))
    }

    fn get_last_change_lsn(&self, tx: &Transaction) -> Result<Lsn, StoreError> {
        let inner = self.lock_inner();
        Self::guard_open(&inner)?;
        let _ = tx;
        Ok(inner.last_commit_lsn)
    }

    fn install_image(&self, rows: Vec<Row>, last_lsn: Lsn) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        Self::guard_open(&inner)?;

        inner.rows.clear();
        inner.lsn_index.clear();
        inner.last_commit_lsn = last_lsn;
        for row in rows {
            inner.index_put(row);
        }

        let image: Vec<Row> = inner.rows.values().cloned().collect();
        inner.log.checkpoint(image, last_lsn)?;
        inner.log.set_backup_chain(None)?;
        Ok(())
    }

    fn purge(&self, keys: &[RowKey]) -> Result<usize, StoreError> {
        let mut inner = self.lock_inner();
        Self::guard_open(&inner)?;

        let last = inner.last_commit_lsn;
        let ops: Vec<RecordOp> = keys
            .iter()
            .filter(|key| inner.rows.contains_key(*key))
            .map(|key| RecordOp::Delete {
                key: key.clone(),
                lsn: last,
            })
            .collect();
        if ops.is_empty() {
            return Ok(0);
        }

        let count = ops.len();
        let record = CommitRecord { lsn: last, ops };
        inner.log.append(&record)?;
        inner.apply_record(&record);
        Ok(count)
    }

    fn commit(&self, tx: &mut Transaction, timeout: Duration) -> Result<Lsn, StoreError> {
        // The commit itself is synchronous; the timeout bounds nothing here
        // but is part of the contract so engines that queue can honor it.
        let _ = timeout;

        let mut inner = self.lock_inner();
        if !inner.open {
            tx.state = TxState::Aborted;
            inner.release_tx(tx.id);
            return Err(StoreError::ObjectClosed);
        }
        Self::guard_active(tx)?;
        tx.state = TxState::Committing;

        if tx.writes.is_empty() {
            tx.state = TxState::Committed;
            inner.release_tx(tx.id);
            return Ok(inner.last_commit_lsn);
        }

        let explicit_max = tx
            .writes
            .iter()
            .filter_map(|w| match w {
                PendingWrite::Insert { explicit_lsn, .. }
                | PendingWrite::Update { explicit_lsn, .. } => *explicit_lsn,
                PendingWrite::Delete { .. } => None,
            })
            .max();

        let commit_lsn = match explicit_max {
            Some(lsn) => {
                if lsn <= inner.last_commit_lsn {
                    tx.state = TxState::Aborted;
                    inner.release_tx(tx.id);
                    return Err(StoreError::ContractViolation(format!(
                        "explicit commit lsn {lsn} does not advance past {}",
                        inner.last_commit_lsn
                    )));
                }
                lsn
            }
            None => inner.last_commit_lsn.next(),
        };

        let now = Timestamp::now();
        let primary_utc = tx.primary_utc_override.unwrap_or(now);

        let mut ops = Vec::with_capacity(tx.writes.len());
        for write in &mut tx.writes {
            match write {
                PendingWrite::Insert { row, explicit_lsn } => {
                    if explicit_lsn.is_none() {
                        row.operation_lsn = commit_lsn;
                    }
                    row.last_modified_utc = now;
                    row.last_modified_on_primary_utc = primary_utc;
                    ops.push(RecordOp::Put(row.clone()));
                }
                PendingWrite::Update {
                    original_key,
                    row,
                    explicit_lsn,
                } => {
                    if explicit_lsn.is_none() {
                        row.operation_lsn = commit_lsn;
                    }
                    row.last_modified_utc = now;
                    row.last_modified_on_primary_utc = primary_utc;
                    if *original_key != row.row_key() {
                        ops.push(RecordOp::Delete {
                            key: original_key.clone(),
                            lsn: commit_lsn,
                        });
                    }
                    ops.push(RecordOp::Put(row.clone()));
                }
                PendingWrite::Delete { key } => {
                    ops.push(RecordOp::Delete {
                        key: key.clone(),
                        lsn: commit_lsn,
                    });
                }
            }
        }

        let record = CommitRecord {
            lsn: commit_lsn,
            ops,
        };

        if let Err(e) = inner.log.append(&record) {
            warn!(error = %e, "commit log append failed, aborting transaction");
            tx.state = TxState::Aborted;
            inner.release_tx(tx.id);
            return Err(e);
        }

        inner.apply_record(&record);
        inner.release_tx(tx.id);
        tx.state = TxState::Committed;
        Ok(commit_lsn)
    }

    fn rollback(&self, tx: &mut Transaction) {
        let mut inner = self.lock_inner();
        if tx.is_active() || tx.state == TxState::Committing {
            inner.release_tx(tx.id);
            tx.state = TxState::RolledBack;
        }
    }

    fn backup(&self, dir: &Path, mode: BackupMode) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        Self::guard_open(&inner)?;
        backup::backup_store(&mut inner, &self.settings, dir, mode)
    }

    fn restore(&self, dir: &Path) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        Self::guard_open(&inner)?;
        backup::restore_store(&mut inner, dir)
    }

    fn merge_backup_chain(
        &self,
        chain_dirs: &[PathBuf],
        merged_dir: &Path,
    ) -> Result<(), StoreError> {
        backup::merge_backup_chain(chain_dirs, merged_dir)
    }

    fn is_incremental_backup_enabled(&self) -> bool {
        self.settings.enable_incremental_backup
    }

    fn is_log_truncation_required(&self) -> bool {
        // Incremental backup pins log segments; periodic truncation keeps
        // the chain length bounded.
        self.settings.enable_incremental_backup
    }

    fn truncate_logs(&self) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        Self::guard_open(&inner)?;
        let rows: Vec<Row> = inner.rows.values().cloned().collect();
        let last = inner.last_commit_lsn;
        inner.log.checkpoint(rows, last)
    }

    fn estimate_row_count(&self) -> Result<usize, StoreError> {
        let inner = self.lock_inner();
        Self::guard_open(&inner)?;
        Ok(inner.rows.len())
    }

    fn estimate_db_size_bytes(&self) -> Result<u64, StoreError> {
        let inner = self.lock_inner();
        Self::guard_open(&inner)?;
        Ok(inner.log.size_bytes())
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        if !inner.open {
            return Ok(());
        }

        let rows: Vec<Row> = inner.rows.values().cloned().collect();
        let last = inner.last_commit_lsn;
        inner.log.checkpoint(rows, last)?;
        inner.open = false;
        Ok(())
    }
}

impl std::fmt::Debug for LogKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogKvStore")
            .field("dir", &self.settings.database_directory)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn set_backup_chain_for_test(
    store: &LogKvStore,
    chain: Option<crate::log::BackupChainState>,
) -> Result<(), StoreError> {
    let mut inner = store.lock_inner();
    inner.log.set_backup_chain(chain)
}
