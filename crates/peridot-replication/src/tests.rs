//! Integration tests for the replicated store.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use peridot_store::{BackupMode, LocalStore, LogKvStore, LocalStoreSettings};
use peridot_types::{ActivityId, Epoch, Lsn, ReplicaRole, Timestamp};

use crate::copy::CopyMode;
use crate::migration::{KeyValueStoreMigrator, MigrationPhase, MigrationSettings};
use crate::replicator::ChannelReplicator;
use crate::settings::ReplicatedStoreSettings;
use crate::store::{CommitOutcome, ReplicatedStore, WriteStatus};
use crate::{ReplicationError, TOMBSTONE_ROW_TYPE};

const TIMEOUT: Duration = Duration::from_secs(5);

fn open_engine(dir: &std::path::Path) -> Arc<LogKvStore> {
    Arc::new(LogKvStore::open(LocalStoreSettings::in_directory(dir)).unwrap())
}

fn make_primary(
    dir: &std::path::Path,
    replica_set_size: usize,
) -> (Arc<ReplicatedStore<LogKvStore>>, Arc<ChannelReplicator>) {
    let replicator = Arc::new(ChannelReplicator::new(replica_set_size));
    let store = Arc::new(
        ReplicatedStore::new(
            open_engine(dir),
            replicator.clone(),
            ReplicatedStoreSettings::default(),
        )
        .unwrap(),
    );
    store
        .change_role(ReplicaRole::Primary, Epoch::new(1, 1))
        .unwrap();
    (store, replicator)
}

fn make_secondary(dir: &std::path::Path) -> Arc<ReplicatedStore<LogKvStore>> {
    let replicator = Arc::new(ChannelReplicator::new(1));
    let store = Arc::new(
        ReplicatedStore::new(
            open_engine(dir),
            replicator,
            ReplicatedStoreSettings::default(),
        )
        .unwrap(),
    );
    store
        .change_role(ReplicaRole::Secondary, Epoch::new(1, 1))
        .unwrap();
    store
}

fn commit_insert(
    store: &ReplicatedStore<LogKvStore>,
    row_type: &str,
    key: &str,
    value: &[u8],
) -> Lsn {
    let mut tx = store.create_transaction(ActivityId::generate()).unwrap();
    store
        .insert(&mut tx, row_type, key, Bytes::copy_from_slice(value))
        .unwrap();
    match store.begin_commit(tx, TIMEOUT).unwrap() {
        CommitOutcome::Committed(lsn) => lsn,
        CommitOutcome::Batched => panic!("user transactions commit synchronously"),
    }
}

// ============================================================================
// S1: single-replica insert/read
// ============================================================================

#[test]
fn single_replica_insert_and_read() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = make_primary(dir.path(), 1);

    let lsn = commit_insert(&store, "T", "k1", &[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(lsn, Lsn::new(1));

    let row = store.read_exact("T", "k1").unwrap();
    assert_eq!(row.value.as_ref(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(row.operation_lsn, Lsn::new(1));
}

// ============================================================================
// Write gating
// ============================================================================

#[test]
fn secondary_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = make_secondary(dir.path());

    let err = store.create_transaction(ActivityId::generate()).unwrap_err();
    assert!(matches!(err, ReplicationError::NotPrimary));
}

#[test]
fn write_status_gates_commits() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = make_primary(dir.path(), 1);

    store.set_write_status(WriteStatus::ReconfigurationPending);
    let err = store.create_transaction(ActivityId::generate()).unwrap_err();
    assert!(matches!(err, ReplicationError::ReconfigurationPending));
    assert!(err.is_retryable());

    store.set_write_status(WriteStatus::Granted);
    assert!(store.create_transaction(ActivityId::generate()).is_ok());
}

#[test]
fn lost_quorum_fails_commit_and_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let (store, replicator) = make_primary(dir.path(), 3);
    let (e1, _p1) = replicator.register_secondary();
    let (e2, _p2) = replicator.register_secondary();

    e1.set_connected(false);
    e2.set_connected(false);

    let mut tx = store.create_transaction(ActivityId::generate()).unwrap();
    store
        .insert(&mut tx, "T", "k", Bytes::from_static(b"v"))
        .unwrap();
    let err = store.begin_commit(tx, TIMEOUT).unwrap_err();
    assert!(matches!(err, ReplicationError::NoWriteQuorum));

    // The failed commit left nothing behind.
    assert!(store.read_exact("T", "k").is_err());
}

// ============================================================================
// Secondary apply
// ============================================================================

#[test]
fn secondary_applies_in_lsn_order() {
    let primary_dir = tempfile::tempdir().unwrap();
    let secondary_dir = tempfile::tempdir().unwrap();

    let (primary, replicator) = make_primary(primary_dir.path(), 2);
    let (_endpoint, pump) = replicator.register_secondary();
    let secondary = make_secondary(secondary_dir.path());

    commit_insert(&primary, "T", "a", b"1");
    commit_insert(&primary, "T", "b", b"2");
    commit_insert(&primary, "T", "c", b"3");

    let applied = secondary.pump_replication(&pump, usize::MAX).unwrap();
    assert_eq!(applied, 3);
    assert_eq!(secondary.get_query_status().last_acked_lsn, Lsn::new(3));
    assert_eq!(secondary.read_exact("T", "b").unwrap().value.as_ref(), b"2");
}

#[test]
fn lsn_gap_on_apply_is_fatal() {
    let primary_dir = tempfile::tempdir().unwrap();
    let secondary_dir = tempfile::tempdir().unwrap();

    let (primary, replicator) = make_primary(primary_dir.path(), 2);
    let (_endpoint, pump) = replicator.register_secondary();
    let secondary = make_secondary(secondary_dir.path());

    commit_insert(&primary, "T", "a", b"1");
    commit_insert(&primary, "T", "b", b"2");

    // Drop the first operation to fabricate a gap.
    let _ = pump.try_next();
    let op = pump.try_next().unwrap();
    let err = secondary.apply_replication_operation(&op).unwrap_err();
    assert!(matches!(
        err,
        ReplicationError::LsnGap {
            expected,
            actual
        } if expected == Lsn::new(1) && actual == Lsn::new(2)
    ));
}

#[test]
fn replicated_delete_propagates_tombstone() {
    let primary_dir = tempfile::tempdir().unwrap();
    let secondary_dir = tempfile::tempdir().unwrap();

    let (primary, replicator) = make_primary(primary_dir.path(), 2);
    let (_endpoint, pump) = replicator.register_secondary();
    let secondary = make_secondary(secondary_dir.path());

    commit_insert(&primary, "T", "k", b"v");
    let mut tx = primary.create_transaction(ActivityId::generate()).unwrap();
    primary.delete(&mut tx, "T", "k", None).unwrap();
    primary.begin_commit(tx, TIMEOUT).unwrap();

    secondary.pump_replication(&pump, usize::MAX).unwrap();
    assert!(secondary.read_exact("T", "k").is_err());
    assert_eq!(secondary.enumerate(TOMBSTONE_ROW_TYPE, "").unwrap().len(), 1);
}

// ============================================================================
// S2: build idle + catch-up via copy stream
// ============================================================================

#[test]
fn copy_stream_catches_up_a_lagging_secondary() {
    let primary_dir = tempfile::tempdir().unwrap();
    let secondary_dir = tempfile::tempdir().unwrap();

    let (primary, replicator) = make_primary(primary_dir.path(), 2);
    let (_endpoint, pump) = replicator.register_secondary();
    let secondary = make_secondary(secondary_dir.path());

    for i in 1..=5 {
        commit_insert(&primary, "T", &format!("k{i}"), format!("v{i}").as_bytes());
    }

    // Secondary applies only the first two operations, then "falls behind".
    secondary.pump_replication(&pump, 2).unwrap();
    assert_eq!(secondary.get_query_status().last_acked_lsn, Lsn::new(2));

    let mut ctx = primary.create_copy_context(Some(Lsn::new(2))).unwrap();
    assert_eq!(ctx.mode(), CopyMode::Logical);
    assert_eq!(ctx.snapshot_lsn(), Lsn::new(5));

    let rows: Vec<_> = ctx.next_batch(usize::MAX);
    secondary
        .apply_copy(CopyMode::Logical, rows, Lsn::new(5))
        .unwrap();

    for i in 3..=5 {
        let row = secondary.read_exact("T", &format!("k{i}")).unwrap();
        assert_eq!(row.value.as_ref(), format!("v{i}").as_bytes());
        assert_eq!(row.operation_lsn, Lsn::new(i));
    }
    assert_eq!(secondary.get_query_status().last_acked_lsn, Lsn::new(5));
}

#[test]
fn rebuild_copy_resets_the_target() {
    let primary_dir = tempfile::tempdir().unwrap();
    let secondary_dir = tempfile::tempdir().unwrap();

    let (primary, _) = make_primary(primary_dir.path(), 1);
    let secondary = make_secondary(secondary_dir.path());

    for i in 1..=5 {
        commit_insert(&primary, "T", &format!("k{i}"), b"v");
    }

    // A brand-new joiner gets a rebuild when the gap is the whole store.
    let mut settings = ReplicatedStoreSettings::default();
    settings.full_copy_threshold_rows = 2;
    primary.update_replicator_settings(settings);

    let mut ctx = primary.create_copy_context(None).unwrap();
    assert_eq!(ctx.mode(), CopyMode::Rebuild);

    let rows = ctx.next_batch(usize::MAX);
    secondary
        .apply_copy(CopyMode::Rebuild, rows, ctx.snapshot_lsn())
        .unwrap();

    assert_eq!(secondary.local().estimate_row_count().unwrap(), 5);
    assert_eq!(secondary.get_query_status().last_acked_lsn, Lsn::new(5));
}

#[test]
fn logical_copy_applies_deletes_through_tombstones() {
    let primary_dir = tempfile::tempdir().unwrap();
    let secondary_dir = tempfile::tempdir().unwrap();

    let (primary, replicator) = make_primary(primary_dir.path(), 2);
    let (_endpoint, pump) = replicator.register_secondary();
    let secondary = make_secondary(secondary_dir.path());

    commit_insert(&primary, "T", "keep", b"v"); // lsn 1
    commit_insert(&primary, "T", "gone", b"v"); // lsn 2
    secondary.pump_replication(&pump, usize::MAX).unwrap();

    // Delete happens after the secondary detaches.
    let mut tx = primary.create_transaction(ActivityId::generate()).unwrap();
    primary.delete(&mut tx, "T", "gone", None).unwrap();
    primary.begin_commit(tx, TIMEOUT).unwrap(); // lsn 3

    let mut ctx = primary.create_copy_context(Some(Lsn::new(2))).unwrap();
    let rows = ctx.next_batch(usize::MAX);
    secondary
        .apply_copy(CopyMode::Logical, rows, ctx.snapshot_lsn())
        .unwrap();

    assert!(secondary.read_exact("T", "gone").is_err());
    assert!(secondary.read_exact("T", "keep").is_ok());
}

// ============================================================================
// S4: tombstone cleanup
// ============================================================================

#[test]
fn tombstone_cleanup_removes_unreachable_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = make_primary(dir.path(), 1);

    commit_insert(&store, "T", "k", b"v1");
    let mut tx = store.create_transaction(ActivityId::generate()).unwrap();
    store.delete(&mut tx, "T", "k", None).unwrap();
    store.begin_commit(tx, TIMEOUT).unwrap();

    assert!(store.read_exact("T", "k").is_err());
    assert_eq!(store.enumerate(TOMBSTONE_ROW_TYPE, "").unwrap().len(), 1);

    // No active copy cursor, retention zero: one pass removes it.
    let removed = store.cleanup_tombstones(Timestamp::now()).unwrap();
    assert_eq!(removed, 1);

    assert!(store.read_exact("T", "k").is_err());
    assert!(store.enumerate_by_lsn(Lsn::ZERO).unwrap().is_empty() || {
        // Only the live rows remain; no trace of the deleted key.
        store
            .enumerate_by_lsn(Lsn::ZERO)
            .unwrap()
            .iter()
            .all(|r| r.key != "k" && !r.key.contains('\u{1}'))
    });
}

#[test]
fn tombstone_cleanup_respects_active_cursors() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = make_primary(dir.path(), 1);

    commit_insert(&store, "T", "k", b"v"); // lsn 1
    let ctx = store.create_copy_context(Some(Lsn::new(1))).unwrap();

    // The delete happens at lsn 2, above the cursor floor: the live cursor
    // may still observe it, so cleanup must keep it.
    let mut tx = store.create_transaction(ActivityId::generate()).unwrap();
    store.delete(&mut tx, "T", "k", None).unwrap();
    store.begin_commit(tx, TIMEOUT).unwrap();

    let removed = store.cleanup_tombstones(Timestamp::now()).unwrap();
    assert_eq!(removed, 0);

    drop(ctx);
    let removed = store.cleanup_tombstones(Timestamp::now()).unwrap();
    assert_eq!(removed, 1);
}

#[test]
fn tombstone_cleanup_honors_retention_window() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = make_primary(dir.path(), 1);

    let mut settings = ReplicatedStoreSettings::default();
    settings.tombstone_retention_ms = 60_000;
    store.update_replicator_settings(settings);

    commit_insert(&store, "T", "k", b"v");
    let mut tx = store.create_transaction(ActivityId::generate()).unwrap();
    store.delete(&mut tx, "T", "k", None).unwrap();
    store.begin_commit(tx, TIMEOUT).unwrap();

    // Young tombstone survives.
    assert_eq!(store.cleanup_tombstones(Timestamp::now()).unwrap(), 0);

    // Pretend a minute passed.
    let later = Timestamp::now().saturating_add(Duration::from_secs(61));
    assert_eq!(store.cleanup_tombstones(later).unwrap(), 1);
}

// ============================================================================
// Simple transactions
// ============================================================================

#[test]
fn simple_transactions_batch_until_the_limit() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = make_primary(dir.path(), 1);

    let mut settings = ReplicatedStoreSettings::default();
    settings.commit_batching_period_ms = 50;
    settings.commit_batching_size_limit = 3;
    store.update_replicator_settings(settings);

    for i in 0..2 {
        let mut tx = store.create_simple_transaction(ActivityId::generate()).unwrap();
        store
            .insert(&mut tx, "T", &format!("k{i}"), Bytes::from_static(b"v"))
            .unwrap();
        assert_eq!(store.begin_commit(tx, TIMEOUT).unwrap(), CommitOutcome::Batched);
    }

    // Third one crosses the size limit: the whole batch commits at one LSN.
    let mut tx = store.create_simple_transaction(ActivityId::generate()).unwrap();
    store.insert(&mut tx, "T", "k2", Bytes::from_static(b"v")).unwrap();
    let outcome = store.begin_commit(tx, TIMEOUT).unwrap();
    assert_eq!(outcome, CommitOutcome::Committed(Lsn::new(1)));

    for i in 0..3 {
        assert_eq!(
            store.read_exact("T", &format!("k{i}")).unwrap().operation_lsn,
            Lsn::new(1)
        );
    }
}

#[test]
fn drain_flushes_the_open_batch() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = make_primary(dir.path(), 1);

    let mut settings = ReplicatedStoreSettings::default();
    settings.commit_batching_period_ms = 50;
    store.update_replicator_settings(settings);

    let mut tx = store.create_simple_transaction(ActivityId::generate()).unwrap();
    store.insert(&mut tx, "T", "k", Bytes::from_static(b"v")).unwrap();
    assert_eq!(store.begin_commit(tx, TIMEOUT).unwrap(), CommitOutcome::Batched);

    let lsn = store.drain_simple_transactions(TIMEOUT).unwrap();
    assert_eq!(lsn, Some(Lsn::new(1)));
    assert!(store.read_exact("T", "k").is_ok());
}

// ============================================================================
// S5: backup / restore round-trip
// ============================================================================

#[test]
fn backup_restore_roundtrip_preserves_lsns() {
    let dir = tempfile::tempdir().unwrap();
    let backup_dir = tempfile::tempdir().unwrap();
    let staging_dir = tempfile::tempdir().unwrap();
    let (store, _) = make_primary(dir.path(), 1);

    for i in 1..=100 {
        commit_insert(&store, "T", &format!("k{i:03}"), format!("v{i}").as_bytes());
    }

    let mut seen_manifest_high = Lsn::ZERO;
    store
        .backup_local(backup_dir.path(), BackupMode::Full, |manifest| {
            seen_manifest_high = manifest.high_lsn;
            Ok(())
        })
        .unwrap();
    assert_eq!(seen_manifest_high, Lsn::new(100));

    // Wipe the replica's content.
    for i in 1..=100 {
        let mut tx = store.create_transaction(ActivityId::generate()).unwrap();
        store.delete(&mut tx, "T", &format!("k{i:03}"), None).unwrap();
        store.begin_commit(tx, TIMEOUT).unwrap();
    }

    store
        .restore_local(&[backup_dir.path().to_path_buf()], staging_dir.path())
        .unwrap();

    assert_eq!(store.get_query_status().last_acked_lsn, Lsn::new(100));
    for i in [1usize, 42, 100] {
        let row = store.read_exact("T", &format!("k{i:03}")).unwrap();
        assert_eq!(row.value.as_ref(), format!("v{i}").as_bytes());
        assert_eq!(row.operation_lsn, Lsn::new(i as i64));
    }
}

#[test]
fn backup_requires_primary() {
    let dir = tempfile::tempdir().unwrap();
    let backup_dir = tempfile::tempdir().unwrap();
    let store = make_secondary(dir.path());

    let err = store
        .backup_local(backup_dir.path(), BackupMode::Full, |_| Ok(()))
        .unwrap_err();
    assert!(matches!(err, ReplicationError::NotPrimary));
}

// ============================================================================
// Data loss
// ============================================================================

#[test]
fn data_loss_handler_issues_new_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = make_primary(dir.path(), 1);
    let before = store.get_current_epoch();

    store.set_data_loss_handler(Box::new(|| true));
    assert!(store.report_data_loss().unwrap());

    let after = store.get_current_epoch();
    assert_eq!(after.data_loss, before.data_loss + 1);
    assert!(after > before);
}

#[test]
fn unchanged_data_loss_keeps_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = make_primary(dir.path(), 1);
    let before = store.get_current_epoch();

    store.set_data_loss_handler(Box::new(|| false));
    assert!(!store.report_data_loss().unwrap());
    assert_eq!(store.get_current_epoch(), before);
}

// ============================================================================
// Epoch updates
// ============================================================================

#[test]
fn update_epoch_is_idempotent_and_ignores_stale() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = make_primary(dir.path(), 1);

    let e2 = Epoch::new(1, 2);
    store.update_epoch(e2);
    store.update_epoch(e2);
    assert_eq!(store.get_current_epoch(), e2);

    store.update_epoch(Epoch::new(1, 1));
    assert_eq!(store.get_current_epoch(), e2);
}

// ============================================================================
// Migration
// ============================================================================

#[test]
fn migration_moves_data_and_mirrors_live_writes() {
    let source_dir = tempfile::tempdir().unwrap();
    let target_dir = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();

    let (source, _) = make_primary(source_dir.path(), 1);
    let target = open_engine(target_dir.path());

    commit_insert(&source, "T", "before", b"v1");

    let migrator = KeyValueStoreMigrator::new(
        source.clone(),
        target.clone(),
        MigrationSettings::new(staging.path()),
    );
    migrator.start().unwrap();
    assert_eq!(migrator.phase(), MigrationPhase::CopyLive);

    // Live writes mirror into the target.
    commit_insert(&source, "T", "during", b"v2");
    let mut tx = source.create_transaction(ActivityId::generate()).unwrap();
    source.delete(&mut tx, "T", "before", None).unwrap();
    source.begin_commit(tx, TIMEOUT).unwrap();

    let report = migrator.finalize().unwrap();
    assert_eq!(migrator.phase(), MigrationPhase::Completed);
    assert_eq!(report.mirrored_commits, 2);

    let tx = target.begin_transaction(peridot_store::Isolation::ReadCommitted).unwrap();
    assert!(target.read_exact(&tx, "T", "during").is_ok());
    assert!(target.read_exact(&tx, "T", "before").is_err());
}

#[test]
fn migration_failure_leaves_source_authoritative() {
    let source_dir = tempfile::tempdir().unwrap();
    let target_dir = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();

    let (source, _) = make_primary(source_dir.path(), 1);
    let target = open_engine(target_dir.path());
    commit_insert(&source, "T", "k", b"v");

    let migrator = KeyValueStoreMigrator::new(
        source.clone(),
        target,
        MigrationSettings::new(staging.path()),
    );
    migrator.start().unwrap();
    let err = migrator.abort("operator cancelled");
    assert!(matches!(err, ReplicationError::MigrationFailed { .. }));
    assert_eq!(migrator.phase(), MigrationPhase::Failed);

    // Source keeps serving.
    assert!(source.read_exact("T", "k").is_ok());
    commit_insert(&source, "T", "k2", b"v");
}

// ============================================================================
// Properties
// ============================================================================

mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Commit order implies LSN order on a single replica.
        #[test]
        fn lsn_monotonicity(keys in proptest::collection::vec("[a-z]{1,8}", 1..20)) {
            let dir = tempfile::tempdir().unwrap();
            let (store, _) = make_primary(dir.path(), 1);

            let mut last = Lsn::ZERO;
            for (i, key) in keys.iter().enumerate() {
                let mut tx = store.create_transaction(ActivityId::generate()).unwrap();
                store
                    .insert(&mut tx, "T", &format!("{key}-{i}"), Bytes::from_static(b"v"))
                    .unwrap();
                let CommitOutcome::Committed(lsn) = store.begin_commit(tx, TIMEOUT).unwrap()
                else {
                    unreachable!()
                };
                prop_assert!(lsn > last);
                last = lsn;
            }
        }

        /// After a copy completes, the joiner holds exactly the rows
        /// observable on the primary at the copy snapshot LSN.
        #[test]
        fn copy_convergence(op_count in 1usize..24) {
            let primary_dir = tempfile::tempdir().unwrap();
            let secondary_dir = tempfile::tempdir().unwrap();
            let (primary, _) = make_primary(primary_dir.path(), 1);
            let secondary = make_secondary(secondary_dir.path());

            // Interleave inserts, updates and deletes.
            for i in 0..op_count {
                let key = format!("k{}", i % 5);
                if i % 3 == 2 && primary.read_exact("T", &key).is_ok() {
                    let mut tx = primary.create_transaction(ActivityId::generate()).unwrap();
                    primary.delete(&mut tx, "T", &key, None).unwrap();
                    primary.begin_commit(tx, TIMEOUT).unwrap();
                } else if primary.read_exact("T", &key).is_ok() {
                    let mut tx = primary.create_transaction(ActivityId::generate()).unwrap();
                    primary
                        .update(&mut tx, "T", &key, None, Bytes::from(format!("v{i}")))
                        .unwrap();
                    primary.begin_commit(tx, TIMEOUT).unwrap();
                } else {
                    let mut tx = primary.create_transaction(ActivityId::generate()).unwrap();
                    primary
                        .insert(&mut tx, "T", &key, Bytes::from(format!("v{i}")))
                        .unwrap();
                    primary.begin_commit(tx, TIMEOUT).unwrap();
                }
            }

            let mut ctx = primary.create_copy_context(Some(Lsn::ZERO)).unwrap();
            let mode = ctx.mode();
            let snapshot = ctx.snapshot_lsn();
            let rows = ctx.next_batch(usize::MAX);
            secondary.apply_copy(mode, rows, snapshot).unwrap();

            let primary_rows = primary.enumerate("T", "").unwrap();
            let secondary_rows = secondary.enumerate("T", "").unwrap();
            prop_assert_eq!(primary_rows, secondary_rows);
        }
    }
}
