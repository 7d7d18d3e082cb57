//! Live migration between storage engines.
//!
//! When a service opts into an engine change, the migrator moves its data
//! from the source replicated store to a target engine while the source
//! stays authoritative:
//!
//! 1. `BackupSource`: full backup of the source engine
//! 2. `RestoreTarget`: the target engine restores the backup image
//! 3. `CopyLive`: the migrator subscribes to the source's committed-write
//!    stream; every source transaction mirrors into a shadow transaction on
//!    the target
//! 4. `Finalize`: the write stream is drained and deletes seen during the
//!    live window are reconciled
//!
//! A failure in either side fails the migration and leaves the source
//! authoritative; the target is discarded.
//!
//! Deletes mirrored during `CopyLive` are tracked in an uncommitted-deletes
//! set: a delete whose shadow application raced the restore image must not
//! resurrect at finalize, so every tracked key is re-verified absent.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use peridot_store::{BackupMode, Isolation, LocalStore, RowKey, StoreError};
use peridot_types::Lsn;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::notification::{ChangeKind, ChangeNotification, StoreSubscriber};
use crate::store::ReplicatedStore;
use crate::ReplicationError;

/// Phases of an engine migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPhase {
    Inactive,
    BackupSource,
    RestoreTarget,
    CopyLive,
    Finalize,
    Completed,
    Failed,
}

/// Migration tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSettings {
    /// Scratch directory for the backup handoff.
    pub staging_dir: PathBuf,

    /// Rows checked per finalize batch when reconciling deletes.
    pub finalize_batch_size: usize,
}

impl MigrationSettings {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            finalize_batch_size: 256,
        }
    }
}

#[derive(Debug, Default)]
struct MirrorState {
    uncommitted_deletes: HashSet<RowKey>,
    failure: Option<String>,
    mirrored_commits: u64,
}

/// Subscriber that mirrors source commits into the target engine.
struct MigrationMirror<T: LocalStore> {
    target: Arc<T>,
    state: Mutex<MirrorState>,
}

impl<T: LocalStore> MigrationMirror<T> {
    fn mirror_commit(&self, lsn: Lsn, changes: &[crate::RowChange]) -> Result<(), StoreError> {
        let mut tx = self.target.begin_transaction(Isolation::ReadCommitted)?;

        for change in changes {
            let key = RowKey::new(change.row_type.clone(), change.key.clone());
            match change.kind {
                ChangeKind::Insert | ChangeKind::Update => {
                    match self.target.read_exact(&tx, &change.row_type, &change.key) {
                        Ok(_) => self.target.update(
                            &mut tx,
                            &change.row_type,
                            &change.key,
                            None,
                            None,
                            change.value.clone(),
                            Some(lsn),
                        )?,
                        Err(StoreError::NotFound { .. }) => self.target.insert(
                            &mut tx,
                            &change.row_type,
                            &change.key,
                            change.value.clone(),
                            Some(lsn),
                        )?,
                        Err(e) => return Err(e),
                    }
                    self.state
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .uncommitted_deletes
                        .remove(&key);
                }
                ChangeKind::Delete => {
                    match self.target.delete(&mut tx, &change.row_type, &change.key, None) {
                        Ok(()) | Err(StoreError::NotFound { .. }) => {}
                        Err(e) => return Err(e),
                    }
                    self.state
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .uncommitted_deletes
                        .insert(key);
                }
            }
        }

        self.target.commit(&mut tx, Duration::from_secs(30))?;
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .mirrored_commits += 1;
        Ok(())
    }
}

impl<T: LocalStore> StoreSubscriber for MigrationMirror<T> {
    fn on_notification(&self, notification: &ChangeNotification) {
        let ChangeNotification::Commit { lsn, changes } = notification else {
            return;
        };
        if self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .failure
            .is_some()
        {
            return;
        }
        if let Err(e) = self.mirror_commit(*lsn, changes) {
            warn!(error = %e, %lsn, "shadow transaction failed, migration will abort");
            self.state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .failure = Some(e.to_string());
        }
    }
}

/// Summary returned by a completed migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub mirrored_commits: u64,
    pub reconciled_deletes: usize,
}

/// Orchestrates a source → target engine migration.
pub struct KeyValueStoreMigrator<S: LocalStore, T: LocalStore> {
    source: Arc<ReplicatedStore<S>>,
    target: Arc<T>,
    settings: MigrationSettings,
    phase: Mutex<MigrationPhase>,
    mirror: Arc<MigrationMirror<T>>,
}

impl<S: LocalStore, T: LocalStore + 'static> KeyValueStoreMigrator<S, T> {
    pub fn new(
        source: Arc<ReplicatedStore<S>>,
        target: Arc<T>,
        settings: MigrationSettings,
    ) -> Self {
        let mirror = Arc::new(MigrationMirror {
            target: target.clone(),
            state: Mutex::new(MirrorState::default()),
        });
        Self {
            source,
            target,
            settings,
            phase: Mutex::new(MigrationPhase::Inactive),
            mirror,
        }
    }

    pub fn phase(&self) -> MigrationPhase {
        *self
            .phase
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_phase(&self, phase: MigrationPhase) {
        *self
            .phase
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = phase;
    }

    fn fail(&self, phase: &'static str, reason: String) -> ReplicationError {
        self.set_phase(MigrationPhase::Failed);
        warn!(phase, %reason, "migration failed, source stays authoritative");
        ReplicationError::MigrationFailed { phase, reason }
    }

    /// Runs `BackupSource` and `RestoreTarget`, then enters `CopyLive`.
    ///
    /// From this point every source commit mirrors to the target until
    /// [`finalize`](Self::finalize) or failure.
    pub fn start(&self) -> Result<(), ReplicationError> {
        if self.phase() != MigrationPhase::Inactive {
            return Err(ReplicationError::ContractViolation(
                "migration already started".to_string(),
            ));
        }

        self.set_phase(MigrationPhase::BackupSource);
        let backup_dir = self.settings.staging_dir.join("migration-backup");
        if let Err(e) = self
            .source
            .backup_local(&backup_dir, BackupMode::Full, |_| Ok(()))
        {
            return Err(self.fail("BackupSource", e.to_string()));
        }

        self.set_phase(MigrationPhase::RestoreTarget);
        if let Err(e) = self.target.restore(&backup_dir) {
            return Err(self.fail("RestoreTarget", e.to_string()));
        }

        self.source.subscribe(self.mirror.clone());
        self.set_phase(MigrationPhase::CopyLive);
        info!("migration entered live copy");
        Ok(())
    }

    /// Drains the live window and reconciles tracked deletes.
    pub fn finalize(&self) -> Result<MigrationReport, ReplicationError> {
        if self.phase() != MigrationPhase::CopyLive {
            return Err(ReplicationError::ContractViolation(format!(
                "finalize in phase {:?}",
                self.phase()
            )));
        }
        self.set_phase(MigrationPhase::Finalize);

        let (failure, deletes, mirrored) = {
            let state = self
                .mirror
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            (
                state.failure.clone(),
                state.uncommitted_deletes.iter().cloned().collect::<Vec<_>>(),
                state.mirrored_commits,
            )
        };

        if let Some(reason) = failure {
            return Err(self.fail("CopyLive", reason));
        }

        // Tracked deletes must not survive in the target, even when the
        // shadow delete raced the restore image.
        let mut reconciled = 0usize;
        for chunk in deletes.chunks(self.settings.finalize_batch_size.max(1)) {
            let mut tx = match self.target.begin_transaction(Isolation::ReadCommitted) {
                Ok(tx) => tx,
                Err(e) => return Err(self.fail("Finalize", e.to_string())),
            };
            let mut dirty = false;
            for key in chunk {
                match self.target.read_exact(&tx, &key.row_type, &key.key) {
                    Ok(_) => {
                        if let Err(e) = self.target.delete(&mut tx, &key.row_type, &key.key, None)
                        {
                            self.target.rollback(&mut tx);
                            return Err(self.fail("Finalize", e.to_string()));
                        }
                        dirty = true;
                        reconciled += 1;
                    }
                    Err(StoreError::NotFound { .. }) => {}
                    Err(e) => {
                        self.target.rollback(&mut tx);
                        return Err(self.fail("Finalize", e.to_string()));
                    }
                }
            }
            if dirty {
                if let Err(e) = self.target.commit(&mut tx, Duration::from_secs(30)) {
                    return Err(self.fail("Finalize", e.to_string()));
                }
            } else {
                self.target.rollback(&mut tx);
            }
        }

        self.set_phase(MigrationPhase::Completed);
        info!(mirrored, reconciled, "migration complete");
        Ok(MigrationReport {
            mirrored_commits: mirrored,
            reconciled_deletes: reconciled,
        })
    }

    /// Aborts the migration; the source stays authoritative.
    pub fn abort(&self, reason: impl Into<String>) -> ReplicationError {
        self.fail("Abort", reason.into())
    }
}
