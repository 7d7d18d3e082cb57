//! The replicated store.
//!
//! Wraps a local engine with the primary/secondary protocol. On the primary,
//! [`ReplicatedStore::begin_commit`] runs the commit pipeline:
//!
//! 1. replicate the transaction's row changes (target LSN assigned by the
//!    replicator)
//! 2. await quorum acknowledgement
//! 3. apply locally with the assigned LSN
//! 4. dispatch change notifications in LSN order
//! 5. return the commit LSN to the caller
//!
//! Success is never surfaced before both quorum acknowledgement and local
//! durability hold. On secondaries, operations pulled from the replication
//! pump apply in strict LSN order; a gap means the replicator contract is
//! broken and the replica must be rebuilt.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use peridot_store::{
    BackupManifest, BackupMode, Isolation, LocalStore, Row, RowKey, StoreError,
};
use peridot_types::{ActivityId, Epoch, Lsn, ReplicaRole, Timestamp};
use tracing::{debug, info, warn};

use crate::copy::{CopyContext, CopyManager, CopyMode, resolve_mode};
use crate::notification::{
    ChangeKind, NotificationDispatcher, RowChange, SecondaryNotificationMode, StoreSubscriber,
};
use crate::replicator::{ReplicationOperation, Replicator, SecondaryPump};
use crate::settings::ReplicatedStoreSettings;
use crate::throttle::{ReplicationThrottle, ThrottleCallback};
use crate::transaction::{ReplicatedTransaction, TxKind};
use crate::{ReplicationError, TOMBSTONE_ROW_TYPE, split_tombstone_key, tombstone_key};

/// Write access gate for the local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteStatus {
    Granted,

    #[default]
    NotPrimary,
    ReconfigurationPending,
    NoWriteQuorum,
}

/// Outcome of `begin_commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Durable and quorum-acknowledged at this LSN.
    Committed(Lsn),

    /// A simple transaction was absorbed into the open commit batch; it
    /// becomes durable when the batch flushes.
    Batched,
}

/// Snapshot of replica status for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryStatus {
    pub role: ReplicaRole,
    pub epoch: Epoch,
    pub last_acked_lsn: Lsn,
    pub write_status: WriteStatus,
    pub replication_queue_depth: usize,
    pub active_copy_count: usize,
}

#[derive(Debug)]
struct StoreState {
    open: bool,
    role: ReplicaRole,
    epoch: Epoch,
    write_status: WriteStatus,

    /// Highest LSN applied (committed) on this replica.
    last_applied_lsn: Lsn,
}

type DataLossHandler = Box<dyn Fn() -> bool + Send + Sync>;

/// A durable, strongly-consistent replicated key-value store for one
/// replica of a partition.
pub struct ReplicatedStore<S: LocalStore> {
    local: Arc<S>,
    replicator: Arc<dyn Replicator>,
    settings: Mutex<ReplicatedStoreSettings>,
    state: Mutex<StoreState>,
    notifications: NotificationDispatcher,
    copy: CopyManager,
    throttle: ReplicationThrottle,
    simple_batch: Mutex<Vec<RowChange>>,
    data_loss_handler: Mutex<Option<DataLossHandler>>,
}

impl<S: LocalStore> ReplicatedStore<S> {
    pub fn new(
        local: Arc<S>,
        replicator: Arc<dyn Replicator>,
        settings: ReplicatedStoreSettings,
    ) -> Result<Self, ReplicationError> {
        let tx = local.begin_transaction(Isolation::ReadCommitted)?;
        let last = local.get_last_change_lsn(&tx)?;

        let throttle = ReplicationThrottle::new(
            settings.throttle_replication_queue_operation_count,
            settings.throttle_replication_queue_size_bytes,
            Duration::from_millis(1000),
        );

        Ok(Self {
            local,
            replicator,
            settings: Mutex::new(settings),
            state: Mutex::new(StoreState {
                open: true,
                role: ReplicaRole::Unknown,
                epoch: Epoch::INVALID,
                write_status: WriteStatus::NotPrimary,
                last_applied_lsn: last,
            }),
            notifications: NotificationDispatcher::new(),
            copy: CopyManager::new(),
            throttle,
            simple_batch: Mutex::new(Vec::new()),
            data_loss_handler: Mutex::new(None),
        })
    }

    pub fn local(&self) -> &Arc<S> {
        &self.local
    }

    pub fn subscribe(&self, subscriber: Arc<dyn StoreSubscriber>) {
        self.notifications.subscribe(subscriber);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_settings(&self) -> std::sync::MutexGuard<'_, ReplicatedStoreSettings> {
        self.settings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // ========================================================================
    // Role, epoch, write status
    // ========================================================================

    /// Applies a role change ordered by the reconfiguration agent.
    ///
    /// A promotion grants write status; any other target revokes it. A
    /// demotion also discards the open simple-transaction batch.
    pub fn change_role(&self, role: ReplicaRole, epoch: Epoch) -> Result<(), ReplicationError> {
        let mut state = self.lock_state();
        if !state.open {
            return Err(ReplicationError::ObjectClosed);
        }

        info!(old = %state.role, new = %role, %epoch, "replica role change");
        state.role = role;
        state.epoch = state.epoch.max(epoch);
        state.write_status = if role == ReplicaRole::Primary {
            WriteStatus::Granted
        } else {
            WriteStatus::NotPrimary
        };
        drop(state);

        if role != ReplicaRole::Primary {
            let dropped = std::mem::take(
                &mut *self
                    .simple_batch
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner),
            );
            if !dropped.is_empty() {
                warn!(
                    count = dropped.len(),
                    "demotion aborted pending simple-transaction batch"
                );
            }
        }
        Ok(())
    }

    /// Sets the write gate (reconfiguration pending, quorum loss).
    pub fn set_write_status(&self, status: WriteStatus) {
        self.lock_state().write_status = status;
    }

    pub fn get_current_epoch(&self) -> Epoch {
        self.lock_state().epoch
    }

    /// Installs a new epoch. Idempotent for the same value; stale epochs
    /// are ignored.
    pub fn update_epoch(&self, epoch: Epoch) {
        let mut state = self.lock_state();
        if epoch > state.epoch {
            state.epoch = epoch;
        } else if epoch < state.epoch {
            debug!(current = %state.epoch, stale = %epoch, "ignoring stale epoch update");
        }
    }

    fn guard_writable(&self) -> Result<(), ReplicationError> {
        let state = self.lock_state();
        if !state.open {
            return Err(ReplicationError::ObjectClosed);
        }
        if state.role != ReplicaRole::Primary {
            return Err(ReplicationError::NotPrimary);
        }
        match state.write_status {
            WriteStatus::Granted => Ok(()),
            WriteStatus::NotPrimary => Err(ReplicationError::NotPrimary),
            WriteStatus::ReconfigurationPending => Err(ReplicationError::ReconfigurationPending),
            WriteStatus::NoWriteQuorum => Err(ReplicationError::NoWriteQuorum),
        }
    }

    // ========================================================================
    // Transactions (primary)
    // ========================================================================

    pub fn create_transaction(
        &self,
        activity_id: ActivityId,
    ) -> Result<ReplicatedTransaction, ReplicationError> {
        self.guard_writable()?;
        let inner = self.local.begin_transaction(Isolation::ReadCommitted)?;
        Ok(ReplicatedTransaction::user(activity_id, inner))
    }

    /// Creates a simple (commutative) transaction eligible for batching.
    pub fn create_simple_transaction(
        &self,
        activity_id: ActivityId,
    ) -> Result<ReplicatedTransaction, ReplicationError> {
        self.guard_writable()?;
        Ok(ReplicatedTransaction::simple(activity_id))
    }

    fn guard_user_row_type(row_type: &str) -> Result<(), ReplicationError> {
        if row_type == TOMBSTONE_ROW_TYPE {
            return Err(ReplicationError::ContractViolation(format!(
                "row type {row_type} is reserved"
            )));
        }
        Ok(())
    }

    pub fn insert(
        &self,
        tx: &mut ReplicatedTransaction,
        row_type: &str,
        key: &str,
        value: Bytes,
    ) -> Result<(), ReplicationError> {
        self.guard_writable()?;
        Self::guard_user_row_type(row_type)?;

        if let TxKind::User { inner } = &mut tx.kind {
            self.local.insert(inner, row_type, key, value.clone(), None)?;
        }
        tx.changes.push(RowChange {
            kind: ChangeKind::Insert,
            row_type: row_type.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    pub fn update(
        &self,
        tx: &mut ReplicatedTransaction,
        row_type: &str,
        key: &str,
        check_lsn: Option<Lsn>,
        value: Bytes,
    ) -> Result<(), ReplicationError> {
        self.guard_writable()?;
        Self::guard_user_row_type(row_type)?;

        if let TxKind::User { inner } = &mut tx.kind {
            self.local
                .update(inner, row_type, key, check_lsn, None, value.clone(), None)?;
        }
        tx.changes.push(RowChange {
            kind: ChangeKind::Update,
            row_type: row_type.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    pub fn delete(
        &self,
        tx: &mut ReplicatedTransaction,
        row_type: &str,
        key: &str,
        check_lsn: Option<Lsn>,
    ) -> Result<(), ReplicationError> {
        self.guard_writable()?;
        Self::guard_user_row_type(row_type)?;

        if let TxKind::User { inner } = &mut tx.kind {
            self.local.delete(inner, row_type, key, check_lsn)?;
            self.write_tombstone(inner, row_type, key, None)?;
        }
        tx.changes.push(RowChange {
            kind: ChangeKind::Delete,
            row_type: row_type.to_string(),
            key: key.to_string(),
            value: Bytes::new(),
        });
        Ok(())
    }

    /// Upserts the tombstone row recording a delete.
    fn write_tombstone(
        &self,
        inner: &mut peridot_store::Transaction,
        row_type: &str,
        key: &str,
        lsn: Option<Lsn>,
    ) -> Result<(), ReplicationError> {
        let ts_key = tombstone_key(row_type, key);
        match self.local.read_exact(inner, TOMBSTONE_ROW_TYPE, &ts_key) {
            Ok(_) => {
                self.local.update(
                    inner,
                    TOMBSTONE_ROW_TYPE,
                    &ts_key,
                    None,
                    None,
                    Bytes::new(),
                    lsn,
                )?;
            }
            Err(StoreError::NotFound { .. }) => {
                self.local
                    .insert(inner, TOMBSTONE_ROW_TYPE, &ts_key, Bytes::new(), lsn)?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Runs the primary commit pipeline for `tx`.
    pub fn begin_commit(
        &self,
        tx: ReplicatedTransaction,
        timeout: Duration,
    ) -> Result<CommitOutcome, ReplicationError> {
        self.guard_writable()?;

        match tx.kind {
            TxKind::User { mut inner } => {
                if tx.changes.is_empty() {
                    let lsn = self.local.commit(&mut inner, timeout)?;
                    return Ok(CommitOutcome::Committed(lsn));
                }
                let lsn = self.replicate_and_commit(&mut inner, &tx.changes, timeout)?;
                Ok(CommitOutcome::Committed(lsn))
            }
            TxKind::Simple => {
                let flush_now = {
                    let settings = self.lock_settings();
                    let mut batch = self
                        .simple_batch
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    batch.extend(tx.changes);
                    settings.commit_batching_period_ms == 0
                        || batch.len() >= settings.commit_batching_size_limit
                };

                if flush_now {
                    match self.drain_simple_transactions(timeout)? {
                        Some(lsn) => Ok(CommitOutcome::Committed(lsn)),
                        None => Ok(CommitOutcome::Batched),
                    }
                } else {
                    Ok(CommitOutcome::Batched)
                }
            }
        }
    }

    /// Rolls back a transaction, releasing its engine locks.
    pub fn rollback(&self, tx: ReplicatedTransaction) {
        if let TxKind::User { mut inner } = tx.kind {
            self.local.rollback(&mut inner);
        }
    }

    /// Flushes the pending simple-transaction batch, if any.
    ///
    /// Called at the end of the commit-batching window and on drain. A
    /// simple transaction that conflicts with a concurrent user transaction
    /// has broken the commutativity assertion and fails the batch with a
    /// contract violation.
    pub fn drain_simple_transactions(
        &self,
        timeout: Duration,
    ) -> Result<Option<Lsn>, ReplicationError> {
        let changes = std::mem::take(
            &mut *self
                .simple_batch
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        if changes.is_empty() {
            return Ok(None);
        }

        self.guard_writable()?;
        let mut inner = self.local.begin_transaction(Isolation::ReadCommitted)?;

        let apply = (|| -> Result<(), ReplicationError> {
            for change in &changes {
                match change.kind {
                    ChangeKind::Insert => self.local.insert(
                        &mut inner,
                        &change.row_type,
                        &change.key,
                        change.value.clone(),
                        None,
                    )?,
                    ChangeKind::Update => self.local.update(
                        &mut inner,
                        &change.row_type,
                        &change.key,
                        None,
                        None,
                        change.value.clone(),
                        None,
                    )?,
                    ChangeKind::Delete => {
                        self.local
                            .delete(&mut inner, &change.row_type, &change.key, None)?;
                        self.write_tombstone(&mut inner, &change.row_type, &change.key, None)?;
                    }
                }
            }
            Ok(())
        })();

        if let Err(e) = apply {
            self.local.rollback(&mut inner);
            return Err(match e {
                ReplicationError::Store(StoreError::DeadlockDetected { row_type, key }) => {
                    ReplicationError::ContractViolation(format!(
                        "simple transaction broke commutativity on {row_type}:{key}"
                    ))
                }
                other => other,
            });
        }

        let lsn = self.replicate_and_commit(&mut inner, &changes, timeout)?;
        Ok(Some(lsn))
    }

    /// Shared tail of the commit pipeline: replicate, stamp, commit, notify.
    fn replicate_and_commit(
        &self,
        inner: &mut peridot_store::Transaction,
        changes: &[RowChange],
        timeout: Duration,
    ) -> Result<Lsn, ReplicationError> {
        let primary_utc = Timestamp::now();
        let lsn = match self
            .replicator
            .replicate(changes.to_vec(), primary_utc, timeout)
        {
            Ok(lsn) => lsn,
            Err(e) => {
                self.local.rollback(inner);
                return Err(e);
            }
        };

        for change in changes {
            match change.kind {
                ChangeKind::Insert | ChangeKind::Update => {
                    self.local
                        .update_operation_lsn(inner, &change.row_type, &change.key, lsn)?;
                }
                ChangeKind::Delete => {
                    let ts_key = tombstone_key(&change.row_type, &change.key);
                    self.local
                        .update_operation_lsn(inner, TOMBSTONE_ROW_TYPE, &ts_key, lsn)?;
                }
            }
        }

        let commit_lsn = self.local.commit(inner, timeout)?;
        debug_assert_eq!(commit_lsn, lsn, "engine commit must land at the replicated lsn");

        self.lock_state().last_applied_lsn = lsn;

        let (depth, bytes) = self.replicator.queue_status();
        self.throttle.observe(depth, bytes, Timestamp::now());

        self.notifications.dispatch_commit(lsn, changes.to_vec());
        Ok(lsn)
    }

    // ========================================================================
    // Secondary apply
    // ========================================================================

    /// Applies one replicated operation on a secondary, in LSN order.
    pub fn apply_replication_operation(
        &self,
        op: &ReplicationOperation,
    ) -> Result<(), ReplicationError> {
        let (expected, mode) = {
            let state = self.lock_state();
            if !state.open {
                return Err(ReplicationError::ObjectClosed);
            }
            if state.role == ReplicaRole::Primary {
                return Err(ReplicationError::ContractViolation(
                    "replication apply on the primary".to_string(),
                ));
            }
            (
                state.last_applied_lsn.next(),
                self.lock_settings().secondary_notification_mode,
            )
        };

        if op.lsn != expected {
            return Err(ReplicationError::LsnGap {
                expected,
                actual: op.lsn,
            });
        }

        let mut inner = self.local.begin_transaction(Isolation::ReadCommitted)?;
        inner.set_primary_utc(op.primary_utc);

        for change in &op.changes {
            match change.kind {
                ChangeKind::Insert => self.local.insert(
                    &mut inner,
                    &change.row_type,
                    &change.key,
                    change.value.clone(),
                    Some(op.lsn),
                )?,
                ChangeKind::Update => self.local.update(
                    &mut inner,
                    &change.row_type,
                    &change.key,
                    None,
                    None,
                    change.value.clone(),
                    Some(op.lsn),
                )?,
                ChangeKind::Delete => {
                    self.local
                        .delete(&mut inner, &change.row_type, &change.key, None)?;
                    self.write_tombstone(&mut inner, &change.row_type, &change.key, Some(op.lsn))?;
                }
            }
        }

        self.local.commit(&mut inner, Duration::from_secs(30))?;
        self.lock_state().last_applied_lsn = op.lsn;

        match mode {
            SecondaryNotificationMode::None => {}
            SecondaryNotificationMode::NonBlockingQuorumAcked
            | SecondaryNotificationMode::BlockSecondaryAck => {
                // With the in-process fabric both modes dispatch inline; the
                // mode decides when the pump acknowledges, not whether the
                // subscriber runs.
                self.notifications.dispatch_commit(op.lsn, op.changes.clone());
            }
        }
        Ok(())
    }

    /// Drains up to `max` operations from the replication pump.
    ///
    /// Under `BlockSecondaryAck` the operation is acknowledged (by virtue of
    /// returning) only after its subscribers have consumed it.
    pub fn pump_replication(
        &self,
        pump: &SecondaryPump,
        max: usize,
    ) -> Result<usize, ReplicationError> {
        let mut applied = 0;
        while applied < max {
            let Some(op) = pump.try_next() else { break };
            self.apply_replication_operation(&op)?;
            applied += 1;
        }
        Ok(applied)
    }

    // ========================================================================
    // Copy streams
    // ========================================================================

    /// Builds a copy context for a joiner reporting `joiner_lsn`.
    ///
    /// Serialized with tombstone cleanup: the context's cursor is registered
    /// under the same lock the cleaner takes, so a tombstone this stream may
    /// observe cannot be removed while the stream is live.
    pub fn create_copy_context(
        &self,
        joiner_lsn: Option<Lsn>,
    ) -> Result<CopyContext, ReplicationError> {
        {
            let state = self.lock_state();
            if !state.open {
                return Err(ReplicationError::ObjectClosed);
            }
            if state.role != ReplicaRole::Primary {
                return Err(ReplicationError::NotPrimary);
            }
        }

        let settings = self.lock_settings().clone();
        let joiner = joiner_lsn.unwrap_or(Lsn::ZERO);

        // Registration and snapshot happen under the cursor lock so cleanup
        // cannot race between the snapshot and the floor becoming visible.
        let mut registry = self.copy.lock();

        let tx = self.local.begin_transaction(Isolation::Serializable)?;
        let snapshot_lsn = self.local.get_last_change_lsn(&tx)?;
        let missing: Vec<Row> = self
            .local
            .enumerate_by_operation_lsn(&tx, joiner)?
            .collect();

        let mode = if joiner == Lsn::ZERO {
            resolve_mode(
                settings.full_copy_mode,
                u64::MAX,
                settings.full_copy_threshold_rows,
            )
        } else {
            resolve_mode(
                settings.full_copy_mode,
                missing.len() as u64,
                settings.full_copy_threshold_rows,
            )
        };

        let items = match mode {
            CopyMode::Logical => missing,
            CopyMode::Rebuild | CopyMode::Physical => {
                // Full image: every live row, tombstones excluded (the
                // target resets, so there is nothing left to delete).
                self.local
                    .enumerate_by_operation_lsn(&tx, Lsn::ZERO)?
                    .filter(|row| row.row_type != TOMBSTONE_ROW_TYPE)
                    .collect()
            }
        };

        let cursor_id = registry.register(joiner);
        drop(registry);

        debug!(
            %joiner,
            %snapshot_lsn,
            ?mode,
            items = items.len(),
            "created copy context"
        );

        Ok(CopyContext::new(
            self.copy.clone(),
            cursor_id,
            mode,
            joiner,
            snapshot_lsn,
            items,
        ))
    }

    /// Applies a copy stream on the joining secondary.
    ///
    /// Logical streams replay row versions (tombstone rows delete their
    /// target); rebuild streams replace the whole store image.
    pub fn apply_copy(
        &self,
        mode: CopyMode,
        rows: Vec<Row>,
        snapshot_lsn: Lsn,
    ) -> Result<(), ReplicationError> {
        {
            let state = self.lock_state();
            if !state.open {
                return Err(ReplicationError::ObjectClosed);
            }
            if state.role == ReplicaRole::Primary {
                return Err(ReplicationError::ContractViolation(
                    "copy apply on the primary".to_string(),
                ));
            }
        }

        // Copy-notification prefetch: subscribers of the configured row
        // types observe copied rows as they install, instead of waiting
        // for the first replicated operation.
        let prefetch_types: Vec<String> = {
            let settings = self.lock_settings();
            if settings.enable_copy_notification_prefetch {
                settings.copy_notification_prefetch_types.clone()
            } else {
                Vec::new()
            }
        };
        let prefetch: Vec<RowChange> = if prefetch_types.is_empty() {
            Vec::new()
        } else {
            rows.iter()
                .filter(|row| prefetch_types.iter().any(|t| *t == row.row_type))
                .map(|row| RowChange {
                    kind: ChangeKind::Update,
                    row_type: row.row_type.clone(),
                    key: row.key.clone(),
                    value: row.value.clone(),
                })
                .collect()
        };

        match mode {
            CopyMode::Rebuild | CopyMode::Physical => {
                self.local.install_image(rows, snapshot_lsn)?;
                self.notifications.reset_ordering(snapshot_lsn);
            }
            CopyMode::Logical => {
                // Group rows by LSN so each source commit applies atomically
                // and the engine sees strictly advancing explicit LSNs.
                let mut groups: Vec<(Lsn, Vec<Row>)> = Vec::new();
                for row in rows {
                    match groups.last_mut() {
                        Some((lsn, group)) if *lsn == row.operation_lsn => group.push(row),
                        _ => groups.push((row.operation_lsn, vec![row])),
                    }
                }

                for (lsn, group) in groups {
                    let mut inner = self.local.begin_transaction(Isolation::ReadCommitted)?;
                    if let Some(first) = group.first() {
                        // Copied rows keep the primary's modification time.
                        inner.set_primary_utc(first.last_modified_on_primary_utc);
                    }
                    for row in group {
                        if row.row_type == TOMBSTONE_ROW_TYPE {
                            if let Some((target_type, target_key)) = split_tombstone_key(&row.key) {
                                match self.local.delete(&mut inner, target_type, target_key, None)
                                {
                                    Ok(()) | Err(StoreError::NotFound { .. }) => {}
                                    Err(e) => return Err(e.into()),
                                }
                            }
                        }
                        self.upsert_row(&mut inner, &row, lsn)?;
                    }
                    self.local.commit(&mut inner, Duration::from_secs(30))?;
                }
            }
        }

        if !prefetch.is_empty() {
            self.notifications.dispatch_copy_prefetch(snapshot_lsn, prefetch);
        }

        self.lock_state().last_applied_lsn = snapshot_lsn;
        info!(%snapshot_lsn, ?mode, "copy stream applied");
        Ok(())
    }

    fn upsert_row(
        &self,
        inner: &mut peridot_store::Transaction,
        row: &Row,
        lsn: Lsn,
    ) -> Result<(), ReplicationError> {
        match self.local.read_exact(inner, &row.row_type, &row.key) {
            Ok(_) => self.local.update(
                inner,
                &row.row_type,
                &row.key,
                None,
                None,
                row.value.clone(),
                Some(lsn),
            )?,
            Err(StoreError::NotFound { .. }) => self.local.insert(
                inner,
                &row.row_type,
                &row.key,
                row.value.clone(),
                Some(lsn),
            )?,
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    // ========================================================================
    // Tombstone cleanup
    // ========================================================================

    /// Runs one tombstone cleanup pass. Returns the number of tombstones
    /// removed.
    ///
    /// The bound is `min(active copy cursors)` (or the replica's own applied
    /// LSN when no cursor is live) combined with the configured retention
    /// window. Holding the cursor lock for the whole pass serializes with
    /// copy-context creation.
    pub fn cleanup_tombstones(&self, now: Timestamp) -> Result<usize, ReplicationError> {
        let (enabled, retention) = {
            let settings = self.lock_settings();
            (
                settings.enable_tombstone_cleanup2,
                settings.tombstone_retention(),
            )
        };
        if !enabled {
            return Ok(0);
        }

        let registry = self.copy.lock();
        let last_applied = self.lock_state().last_applied_lsn;
        let bound = registry.min_floor().unwrap_or(last_applied).min(last_applied);

        let tx = self.local.begin_transaction(Isolation::ReadCommitted)?;
        let victims: Vec<RowKey> = self
            .local
            .enumerate_by_type_and_key(&tx, TOMBSTONE_ROW_TYPE, "")?
            .filter(|row| {
                row.operation_lsn <= bound
                    && now.duration_since(row.last_modified_utc) >= retention
            })
            .map(|row| RowKey::new(TOMBSTONE_ROW_TYPE, row.key))
            .collect();
        drop(tx);

        if victims.is_empty() {
            return Ok(0);
        }

        let removed = self.local.purge(&victims)?;
        drop(registry);

        debug!(removed, %bound, "tombstone cleanup pass complete");
        Ok(removed)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Reads a single row by exact `(type, key)`.
    pub fn read_exact(&self, row_type: &str, key: &str) -> Result<Row, ReplicationError> {
        if !self.lock_state().open {
            return Err(ReplicationError::ObjectClosed);
        }
        let tx = self.local.begin_transaction(Isolation::ReadCommitted)?;
        Ok(self.local.read_exact(&tx, row_type, key)?)
    }

    /// Enumerates rows by type with `key >= key_start`.
    pub fn enumerate(
        &self,
        row_type: &str,
        key_start: &str,
    ) -> Result<Vec<Row>, ReplicationError> {
        if !self.lock_state().open {
            return Err(ReplicationError::ObjectClosed);
        }
        let tx = self.local.begin_transaction(Isolation::ReadCommitted)?;
        Ok(self
            .local
            .enumerate_by_type_and_key(&tx, row_type, key_start)?
            .collect())
    }

    /// Enumerates every row with `lsn > from_lsn` in LSN order.
    pub fn enumerate_by_lsn(&self, from_lsn: Lsn) -> Result<Vec<Row>, ReplicationError> {
        if !self.lock_state().open {
            return Err(ReplicationError::ObjectClosed);
        }
        let tx = self.local.begin_transaction(Isolation::ReadCommitted)?;
        Ok(self.local.enumerate_by_operation_lsn(&tx, from_lsn)?.collect())
    }

    // ========================================================================
    // Backup / restore
    // ========================================================================

    /// Takes a backup on the primary; `post_backup` runs with the archive
    /// manifest before success is reported (typically to upload the
    /// archive). Its error fails the backup.
    pub fn backup_local<F>(
        &self,
        dir: &Path,
        mode: BackupMode,
        post_backup: F,
    ) -> Result<(), ReplicationError>
    where
        F: FnOnce(&BackupManifest) -> Result<(), ReplicationError>,
    {
        if self.lock_state().role != ReplicaRole::Primary {
            return Err(ReplicationError::NotPrimary);
        }

        self.local.backup(dir, mode)?;
        if mode != BackupMode::TruncateLogsOnly {
            let manifest = BackupManifest::load(dir)?;
            post_backup(&manifest)?;
        }
        Ok(())
    }

    /// Restores from a backup chain (one full plus zero or more
    /// incrementals, in order). The replica's LSN bookkeeping resets to the
    /// restored image; the reconfiguration that follows re-seeds
    /// replication.
    pub fn restore_local(
        &self,
        chain_dirs: &[PathBuf],
        staging_dir: &Path,
    ) -> Result<(), ReplicationError> {
        if self.lock_state().role != ReplicaRole::Primary {
            return Err(ReplicationError::NotPrimary);
        }

        let restore_dir = if chain_dirs.len() > 1 {
            self.local.merge_backup_chain(chain_dirs, staging_dir)?;
            staging_dir.to_path_buf()
        } else {
            chain_dirs
                .first()
                .cloned()
                .ok_or_else(|| ReplicationError::ContractViolation("empty backup chain".into()))?
        };

        self.local.restore(&restore_dir)?;

        let tx = self.local.begin_transaction(Isolation::ReadCommitted)?;
        let last = self.local.get_last_change_lsn(&tx)?;
        drop(tx);

        self.lock_state().last_applied_lsn = last;
        self.notifications.reset_ordering(last);
        info!(high_lsn = %last, "restore complete, replica requires rebuild");
        Ok(())
    }

    // ========================================================================
    // Data loss
    // ========================================================================

    pub fn set_data_loss_handler(&self, handler: DataLossHandler) {
        *self
            .data_loss_handler
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handler);
    }

    /// Reports data loss to the registered handler.
    ///
    /// Returns whether the handler changed state; if it did, the replica is
    /// logically reset and a new epoch (data-loss number incremented) is
    /// issued.
    pub fn report_data_loss(&self) -> Result<bool, ReplicationError> {
        let changed = {
            let handler = self
                .data_loss_handler
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match handler.as_ref() {
                Some(h) => h(),
                None => false,
            }
        };

        if changed {
            let mut state = self.lock_state();
            state.epoch = state.epoch.next_data_loss();
            drop(state);
            self.notifications.dispatch_data_loss();
        }
        Ok(changed)
    }

    // ========================================================================
    // Status, settings, lifecycle
    // ========================================================================

    pub fn set_throttle_callback(&self, callback: ThrottleCallback) {
        self.throttle.set_callback(callback);
    }

    pub fn throttle(&self) -> &ReplicationThrottle {
        &self.throttle
    }

    pub fn get_query_status(&self) -> QueryStatus {
        let state = self.lock_state();
        let (depth, _) = self.replicator.queue_status();
        QueryStatus {
            role: state.role,
            epoch: state.epoch,
            last_acked_lsn: state.last_applied_lsn,
            write_status: state.write_status,
            replication_queue_depth: depth,
            active_copy_count: self.copy.lock().active(),
        }
    }

    /// Swaps in new replicator-facing settings.
    pub fn update_replicator_settings(&self, settings: ReplicatedStoreSettings) {
        *self.lock_settings() = settings;
    }

    /// Closes the store: drains the simple batch if this replica can still
    /// write, then closes the engine.
    pub fn close(&self) -> Result<(), ReplicationError> {
        let drain_timeout = self.lock_settings().transaction_drain_timeout();
        if self.guard_writable().is_ok() {
            let _ = self.drain_simple_transactions(drain_timeout);
        }

        let mut state = self.lock_state();
        if !state.open {
            return Ok(());
        }
        state.open = false;
        drop(state);

        self.local.close()?;
        Ok(())
    }
}

impl<S: LocalStore> std::fmt::Debug for ReplicatedStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("ReplicatedStore")
            .field("role", &state.role)
            .field("epoch", &state.epoch)
            .field("last_applied_lsn", &state.last_applied_lsn)
            .finish_non_exhaustive()
    }
}
