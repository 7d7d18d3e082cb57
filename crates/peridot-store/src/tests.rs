//! Integration tests for the log-structured engine.

use std::time::Duration;

use bytes::Bytes;
use peridot_types::Lsn;

use crate::backup::BackupMode;
use crate::engine::{Isolation, LocalStore};
use crate::kv::{LogKvStore, set_backup_chain_for_test};
use crate::settings::LocalStoreSettings;
use crate::StoreError;

const TIMEOUT: Duration = Duration::from_secs(5);

fn open_store(dir: &std::path::Path) -> LogKvStore {
    LogKvStore::open(LocalStoreSettings::in_directory(dir)).unwrap()
}

fn put(store: &LogKvStore, row_type: &str, key: &str, value: &[u8]) -> Lsn {
    let mut tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    store
        .insert(&mut tx, row_type, key, Bytes::copy_from_slice(value), None)
        .unwrap();
    store.commit(&mut tx, TIMEOUT).unwrap()
}

// ============================================================================
// Basic CRUD and LSN assignment
// ============================================================================

#[test]
fn first_commit_gets_lsn_one() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let lsn = put(&store, "T", "k1", &[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(lsn, Lsn::new(1));

    let tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    let row = store.read_exact(&tx, "T", "k1").unwrap();
    assert_eq!(row.value.as_ref(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(row.operation_lsn, Lsn::new(1));
}

#[test]
fn lsns_are_strictly_increasing() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut last = Lsn::ZERO;
    for i in 0..10 {
        let lsn = put(&store, "T", &format!("k{i}"), b"v");
        assert!(lsn > last);
        last = lsn;
    }
}

#[test]
fn duplicate_insert_fails_with_key_exists() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    put(&store, "T", "k", b"v");

    let mut tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    let err = store
        .insert(&mut tx, "T", "k", Bytes::from_static(b"v2"), None)
        .unwrap_err();
    assert!(matches!(err, StoreError::KeyExists { .. }));
    store.rollback(&mut tx);
}

#[test]
fn update_with_lsn_check_detects_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let lsn = put(&store, "T", "k", b"v1");

    // Matching check succeeds.
    let mut tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    store
        .update(&mut tx, "T", "k", Some(lsn), None, Bytes::from_static(b"v2"), None)
        .unwrap();
    store.commit(&mut tx, TIMEOUT).unwrap();

    // Stale check fails.
    let mut tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    let err = store
        .update(&mut tx, "T", "k", Some(lsn), None, Bytes::from_static(b"v3"), None)
        .unwrap_err();
    assert!(matches!(err, StoreError::WriteConflict { .. }));
    store.rollback(&mut tx);
}

#[test]
fn delete_removes_row() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    put(&store, "T", "k", b"v");

    let mut tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    store.delete(&mut tx, "T", "k", None).unwrap();
    store.commit(&mut tx, TIMEOUT).unwrap();

    let tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    assert!(matches!(
        store.read_exact(&tx, "T", "k"),
        Err(StoreError::NotFound { .. })
    ));
}

#[test]
fn rename_via_update_moves_the_row() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    put(&store, "T", "old", b"v");

    let mut tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    store
        .update(&mut tx, "T", "old", None, Some("new"), Bytes::from_static(b"v"), None)
        .unwrap();
    store.commit(&mut tx, TIMEOUT).unwrap();

    let tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    assert!(store.read_exact(&tx, "T", "old").is_err());
    assert!(store.read_exact(&tx, "T", "new").is_ok());
}

// ============================================================================
// Isolation
// ============================================================================

#[test]
fn serializable_snapshot_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    put(&store, "T", "k", b"v1");

    let reader = store.begin_transaction(Isolation::Serializable).unwrap();

    let mut writer = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    store
        .update(&mut writer, "T", "k", None, None, Bytes::from_static(b"v2"), None)
        .unwrap();
    store.commit(&mut writer, TIMEOUT).unwrap();

    // The serializable reader still sees the snapshot value.
    let row = store.read_exact(&reader, "T", "k").unwrap();
    assert_eq!(row.value.as_ref(), b"v1");

    // A read-committed reader sees the new value.
    let rc = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    let row = store.read_exact(&rc, "T", "k").unwrap();
    assert_eq!(row.value.as_ref(), b"v2");
}

#[test]
fn transaction_reads_its_own_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin_transaction(Isolation::Serializable).unwrap();
    store
        .insert(&mut tx, "T", "k", Bytes::from_static(b"v"), None)
        .unwrap();
    let row = store.read_exact(&tx, "T", "k").unwrap();
    assert_eq!(row.value.as_ref(), b"v");
    store.rollback(&mut tx);

    let tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    assert!(store.read_exact(&tx, "T", "k").is_err());
}

#[test]
fn conflicting_writers_abort_instead_of_deadlocking() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    put(&store, "T", "k", b"v");

    let mut tx1 = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    let mut tx2 = store.begin_transaction(Isolation::ReadCommitted).unwrap();

    store
        .update(&mut tx1, "T", "k", None, None, Bytes::from_static(b"a"), None)
        .unwrap();
    let err = store
        .update(&mut tx2, "T", "k", None, None, Bytes::from_static(b"b"), None)
        .unwrap_err();
    assert!(matches!(err, StoreError::DeadlockDetected { .. }));
    assert!(err.is_retryable());

    store.rollback(&mut tx2);
    store.commit(&mut tx1, TIMEOUT).unwrap();
}

// ============================================================================
// Enumeration
// ============================================================================

#[test]
fn enumerate_by_type_and_key_is_sorted_and_filtered() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    put(&store, "A", "x", b"1");
    put(&store, "T", "c", b"2");
    put(&store, "T", "a", b"3");
    put(&store, "T", "b", b"4");
    put(&store, "Z", "a", b"5");

    let tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    let keys: Vec<String> = store
        .enumerate_by_type_and_key(&tx, "T", "")
        .unwrap()
        .map(|r| r.key)
        .collect();
    assert_eq!(keys, vec!["a", "b", "c"]);

    let keys: Vec<String> = store
        .enumerate_by_type_and_key(&tx, "T", "b")
        .unwrap()
        .map(|r| r.key)
        .collect();
    assert_eq!(keys, vec!["b", "c"]);
}

#[test]
fn enumerate_by_operation_lsn_yields_lsn_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    for i in 1..=5 {
        put(&store, "T", &format!("k{i}"), b"v");
    }

    let tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    let lsns: Vec<i64> = store
        .enumerate_by_operation_lsn(&tx, Lsn::new(2))
        .unwrap()
        .map(|r| r.operation_lsn.as_i64())
        .collect();
    assert_eq!(lsns, vec![3, 4, 5]);
}

#[test]
fn overwritten_rows_surface_only_the_latest_lsn() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    put(&store, "T", "k", b"v1"); // lsn 1

    let mut tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    store
        .update(&mut tx, "T", "k", None, None, Bytes::from_static(b"v2"), None)
        .unwrap();
    store.commit(&mut tx, TIMEOUT).unwrap(); // lsn 2

    let tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    let rows: Vec<_> = store.enumerate_by_operation_lsn(&tx, Lsn::ZERO).unwrap().collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].operation_lsn, Lsn::new(2));
}

// ============================================================================
// Explicit LSNs (replication apply path)
// ============================================================================

#[test]
fn explicit_lsn_commit_advances_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    store
        .insert(&mut tx, "T", "k", Bytes::from_static(b"v"), Some(Lsn::new(7)))
        .unwrap();
    let lsn = store.commit(&mut tx, TIMEOUT).unwrap();
    assert_eq!(lsn, Lsn::new(7));

    let tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    assert_eq!(store.get_last_change_lsn(&tx).unwrap(), Lsn::new(7));

    // The next implicit commit continues past the explicit LSN.
    let lsn = put(&store, "T", "k2", b"v");
    assert_eq!(lsn, Lsn::new(8));
}

#[test]
fn regressing_explicit_lsn_is_a_contract_violation() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    put(&store, "T", "k1", b"v"); // lsn 1
    put(&store, "T", "k2", b"v"); // lsn 2

    let mut tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    store
        .insert(&mut tx, "T", "k3", Bytes::from_static(b"v"), Some(Lsn::new(2)))
        .unwrap();
    let err = store.commit(&mut tx, TIMEOUT).unwrap_err();
    assert!(matches!(err, StoreError::ContractViolation(_)));
}

#[test]
fn update_operation_lsn_restamps_pending_write() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    store
        .insert(&mut tx, "T", "k", Bytes::from_static(b"v"), None)
        .unwrap();
    store.update_operation_lsn(&mut tx, "T", "k", Lsn::new(42)).unwrap();
    let lsn = store.commit(&mut tx, TIMEOUT).unwrap();
    assert_eq!(lsn, Lsn::new(42));
}

// ============================================================================
// Durability
// ============================================================================

#[test]
fn rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(dir.path());
        put(&store, "T", "k1", b"v1");
        put(&store, "T", "k2", b"v2");
    }

    let store = open_store(dir.path());
    let tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    assert_eq!(store.read_exact(&tx, "T", "k1").unwrap().value.as_ref(), b"v1");
    assert_eq!(store.get_last_change_lsn(&tx).unwrap(), Lsn::new(2));
}

#[test]
fn truncate_logs_preserves_state_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(dir.path());
        for i in 0..20 {
            put(&store, "T", &format!("k{i}"), b"v");
        }
        store.truncate_logs().unwrap();
        put(&store, "T", "after", b"v");
    }

    let store = open_store(dir.path());
    assert_eq!(store.estimate_row_count().unwrap(), 21);
}

#[test]
fn closed_store_rejects_everything() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    store.close().unwrap();

    assert!(matches!(
        store.begin_transaction(Isolation::ReadCommitted),
        Err(StoreError::ObjectClosed)
    ));
    assert!(matches!(store.estimate_row_count(), Err(StoreError::ObjectClosed)));
}

// ============================================================================
// Backup and restore
// ============================================================================

#[test]
fn full_backup_restore_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let backup_dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    for i in 1..=100 {
        put(&store, "T", &format!("k{i:03}"), format!("v{i}").as_bytes());
    }
    let tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    let high = store.get_last_change_lsn(&tx).unwrap();
    drop(tx);

    store.backup(backup_dir.path(), BackupMode::Full).unwrap();

    // Wipe: delete every row.
    let mut tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    for i in 1..=100 {
        store.delete(&mut tx, "T", &format!("k{i:03}"), None).unwrap();
    }
    store.commit(&mut tx, TIMEOUT).unwrap();
    assert_eq!(store.estimate_row_count().unwrap(), 0);

    store.restore(backup_dir.path()).unwrap();

    assert_eq!(store.estimate_row_count().unwrap(), 100);
    let tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    assert_eq!(store.get_last_change_lsn(&tx).unwrap(), high);
    let row = store.read_exact(&tx, "T", "k042").unwrap();
    assert_eq!(row.value.as_ref(), b"v42");
    assert_eq!(row.operation_lsn, Lsn::new(42));
}

#[test]
fn incremental_requires_enabled_setting_and_chain() {
    let dir = tempfile::tempdir().unwrap();
    let backup_dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    put(&store, "T", "k", b"v");

    let err = store.backup(backup_dir.path(), BackupMode::Incremental).unwrap_err();
    assert!(matches!(err, StoreError::IncrementalBackupUnavailable { .. }));

    let store = LogKvStore::open(
        LocalStoreSettings::in_directory(dir.path()).with_incremental_backup(true),
    )
    .unwrap();
    set_backup_chain_for_test(&store, None).unwrap();
    let err = store.backup(backup_dir.path(), BackupMode::Incremental).unwrap_err();
    assert!(matches!(err, StoreError::IncrementalBackupUnavailable { .. }));
}

#[test]
fn backup_chain_merge_restores_full_state() {
    let dir = tempfile::tempdir().unwrap();
    let full_dir = tempfile::tempdir().unwrap();
    let incr_dir = tempfile::tempdir().unwrap();
    let merged_dir = tempfile::tempdir().unwrap();

    let store = LogKvStore::open(
        LocalStoreSettings::in_directory(dir.path()).with_incremental_backup(true),
    )
    .unwrap();

    put(&store, "T", "base", b"v1");
    store.backup(full_dir.path(), BackupMode::Full).unwrap();

    put(&store, "T", "extra", b"v2");
    let mut tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    store.delete(&mut tx, "T", "base", None).unwrap();
    store.commit(&mut tx, TIMEOUT).unwrap();
    store.backup(incr_dir.path(), BackupMode::Incremental).unwrap();

    store
        .merge_backup_chain(
            &[full_dir.path().to_path_buf(), incr_dir.path().to_path_buf()],
            merged_dir.path(),
        )
        .unwrap();

    store.restore(merged_dir.path()).unwrap();
    let tx = store.begin_transaction(Isolation::ReadCommitted).unwrap();
    assert!(store.read_exact(&tx, "T", "base").is_err());
    assert_eq!(store.read_exact(&tx, "T", "extra").unwrap().value.as_ref(), b"v2");
}

#[test]
fn out_of_order_chain_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let full_dir = tempfile::tempdir().unwrap();
    let incr1 = tempfile::tempdir().unwrap();
    let incr2 = tempfile::tempdir().unwrap();
    let merged = tempfile::tempdir().unwrap();

    let store = LogKvStore::open(
        LocalStoreSettings::in_directory(dir.path()).with_incremental_backup(true),
    )
    .unwrap();

    put(&store, "T", "a", b"v");
    store.backup(full_dir.path(), BackupMode::Full).unwrap();
    put(&store, "T", "b", b"v");
    store.backup(incr1.path(), BackupMode::Incremental).unwrap();
    put(&store, "T", "c", b"v");
    store.backup(incr2.path(), BackupMode::Incremental).unwrap();

    // Swapped incrementals break the from-lsn chain.
    let err = store
        .merge_backup_chain(
            &[
                full_dir.path().to_path_buf(),
                incr2.path().to_path_buf(),
                incr1.path().to_path_buf(),
            ],
            merged.path(),
        )
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidBackupChain { .. }));
}
