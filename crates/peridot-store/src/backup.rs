//! Backup, restore and backup-chain merge for the log-structured engine.
//!
//! # Archive Layout
//!
//! ```text
//! {backup_dir}/
//! ├── backup.manifest.json   <- BackupManifest (chain root, lsn range)
//! ├── full.db                <- full row image (Full archives only)
//! └── incremental.records    <- commit records (Incremental archives only)
//! ```
//!
//! A chain is one full backup plus zero or more incrementals; each
//! incremental references the chain root GUID and starts exactly at the high
//! LSN of the prior archive. Restore operates on a single full archive;
//! [`merge_backup_chain`] materializes a chain into one.

use std::fs;
use std::path::{Path, PathBuf};

use peridot_types::{Lsn, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::codec::{DecodedFrame, decode_frame, encode_frame};
use crate::kv::Inner;
use crate::log::{
    BackupChainState, Checkpoint, CommitRecord, read_checkpoint_file, write_checkpoint_file,
};
use crate::row::Row;
use crate::settings::LocalStoreSettings;
use crate::StoreError;

const BACKUP_MANIFEST_FILENAME: &str = "backup.manifest.json";
const FULL_IMAGE_FILENAME: &str = "full.db";
const INCREMENTAL_FILENAME: &str = "incremental.records";

/// How a backup is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupMode {
    /// Snapshot all rows and the current high LSN; starts a new chain.
    Full,

    /// Archive only the commits past the chain's last archive. Requires a
    /// prior full backup and `enable_incremental_backup`.
    Incremental,

    /// Rotate (truncate) logs without emitting data.
    TruncateLogsOnly,
}

/// Metadata describing one backup archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub backup_id: Uuid,

    /// GUID of the chain's full backup. Equal to `backup_id` for fulls.
    pub chain_root: Uuid,

    pub mode: BackupMode,

    /// Exclusive lower LSN bound of this archive (ZERO for fulls).
    pub from_lsn: Lsn,

    /// Inclusive upper LSN bound of this archive.
    pub high_lsn: Lsn,

    pub row_count: u64,
    pub created_at_nanos: u64,
}

impl BackupManifest {
    fn save(&self, dir: &Path) -> Result<(), StoreError> {
        let path = dir.join(BACKUP_MANIFEST_FILENAME);
        let json = serde_json::to_string_pretty(self).map_err(|e| StoreError::Manifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&path, json)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(BACKUP_MANIFEST_FILENAME);
        let json = fs::read_to_string(&path)?;
        serde_json::from_str(&json).map_err(|e| StoreError::Manifest {
            path,
            reason: e.to_string(),
        })
    }
}

fn write_records_file(path: &Path, records: &[CommitRecord]) -> Result<(), StoreError> {
    let mut buf = Vec::new();
    for record in records {
        let payload = postcard::to_allocvec(record)?;
        buf.extend_from_slice(&encode_frame(&payload));
    }
    fs::write(path, buf)?;
    Ok(())
}

fn read_records_file(path: &Path) -> Result<Vec<CommitRecord>, StoreError> {
    let buf = fs::read(path)?;
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        match decode_frame(&buf[pos..])? {
            DecodedFrame::Complete { payload, consumed } => {
                records.push(postcard::from_bytes::<CommitRecord>(&payload)?);
                pos += consumed;
            }
            DecodedFrame::Torn => {
                return Err(StoreError::CorruptStore {
                    reason: format!("truncated archive {}", path.display()),
                });
            }
        }
    }
    Ok(records)
}

/// Takes a backup of the store in `mode` into `dir`.
pub(crate) fn backup_store(
    inner: &mut Inner,
    settings: &LocalStoreSettings,
    dir: &Path,
    mode: BackupMode,
) -> Result<(), StoreError> {
    match mode {
        BackupMode::TruncateLogsOnly => {
            let rows: Vec<Row> = inner.rows.values().cloned().collect();
            let last = inner.last_commit_lsn;
            return inner.log.checkpoint(rows, last);
        }
        BackupMode::Incremental => {
            if !settings.enable_incremental_backup {
                return Err(StoreError::IncrementalBackupUnavailable {
                    reason: "incremental backup is disabled",
                });
            }
        }
        BackupMode::Full => {}
    }

    fs::create_dir_all(dir)?;
    let high_lsn = inner.last_commit_lsn;
    let backup_id = Uuid::new_v4();

    match mode {
        BackupMode::Full => {
            let rows: Vec<Row> = inner.rows.values().cloned().collect();
            let row_count = rows.len() as u64;
            write_checkpoint_file(
                &dir.join(FULL_IMAGE_FILENAME),
                &Checkpoint {
                    last_lsn: high_lsn,
                    rows,
                },
            )?;

            BackupManifest {
                backup_id,
                chain_root: backup_id,
                mode,
                from_lsn: Lsn::ZERO,
                high_lsn,
                row_count,
                created_at_nanos: Timestamp::now().as_nanos(),
            }
            .save(dir)?;

            inner.log.set_backup_chain(Some(BackupChainState {
                root: backup_id,
                last_backup_lsn: high_lsn,
            }))?;
        }
        BackupMode::Incremental => {
            let chain = inner.log.backup_chain().ok_or(
                StoreError::IncrementalBackupUnavailable {
                    reason: "no full backup in chain",
                },
            )?;

            let records = inner.log.records_after(chain.last_backup_lsn)?;
            let row_count = records.iter().map(|r| r.ops.len() as u64).sum();
            write_records_file(&dir.join(INCREMENTAL_FILENAME), &records)?;

            BackupManifest {
                backup_id,
                chain_root: chain.root,
                mode,
                from_lsn: chain.last_backup_lsn,
                high_lsn,
                row_count,
                created_at_nanos: Timestamp::now().as_nanos(),
            }
            .save(dir)?;

            inner.log.set_backup_chain(Some(BackupChainState {
                root: chain.root,
                last_backup_lsn: high_lsn,
            }))?;
        }
        BackupMode::TruncateLogsOnly => unreachable!("handled above"),
    }

    info!(dir = %dir.display(), ?mode, %high_lsn, "backup complete");
    Ok(())
}

/// Restores the store from a full (or merged) archive, replacing all content.
pub(crate) fn restore_store(inner: &mut Inner, dir: &Path) -> Result<(), StoreError> {
    let manifest = BackupManifest::load(dir)?;
    if manifest.mode != BackupMode::Full {
        return Err(StoreError::InvalidBackupChain {
            reason: "restore requires a full or merged archive".to_string(),
        });
    }

    let image = read_checkpoint_file(&dir.join(FULL_IMAGE_FILENAME))?;

    inner.rows.clear();
    inner.lsn_index.clear();
    inner.last_commit_lsn = image.last_lsn;
    for row in image.rows {
        inner.index_put(row);
    }

    // Re-seed durability: the restored image becomes the checkpoint and the
    // old segments are dropped.
    let rows: Vec<Row> = inner.rows.values().cloned().collect();
    let last = inner.last_commit_lsn;
    inner.log.checkpoint(rows, last)?;
    inner.log.set_backup_chain(None)?;

    info!(dir = %dir.display(), rows = inner.rows.len(), high_lsn = %last, "restore complete");
    Ok(())
}

/// Merges a backup chain into a single full archive at `merged_dir`.
///
/// `chain_dirs` must be ordered: the full first, then each incremental in
/// chain order. Validation is strict; any gap or root mismatch fails.
pub(crate) fn merge_backup_chain(
    chain_dirs: &[PathBuf],
    merged_dir: &Path,
) -> Result<(), StoreError> {
    let Some((full_dir, incrementals)) = chain_dirs.split_first() else {
        return Err(StoreError::InvalidBackupChain {
            reason: "empty backup chain".to_string(),
        });
    };

    let full = BackupManifest::load(full_dir)?;
    if full.mode != BackupMode::Full {
        return Err(StoreError::InvalidBackupChain {
            reason: "chain must start with a full backup".to_string(),
        });
    }

    let image = read_checkpoint_file(&full_dir.join(FULL_IMAGE_FILENAME))?;
    let mut rows: std::collections::BTreeMap<crate::row::RowKey, Row> = image
        .rows
        .into_iter()
        .map(|row| (row.row_key(), row))
        .collect();
    let mut high_lsn = full.high_lsn;

    for dir in incrementals {
        let manifest = BackupManifest::load(dir)?;
        if manifest.mode != BackupMode::Incremental {
            return Err(StoreError::InvalidBackupChain {
                reason: "non-incremental archive after chain head".to_string(),
            });
        }
        if manifest.chain_root != full.chain_root {
            return Err(StoreError::InvalidBackupChain {
                reason: format!(
                    "archive {} belongs to chain {}, expected {}",
                    manifest.backup_id, manifest.chain_root, full.chain_root
                ),
            });
        }
        if manifest.from_lsn != high_lsn {
            return Err(StoreError::InvalidBackupChain {
                reason: format!(
                    "archive {} starts at {} but chain is at {}",
                    manifest.backup_id, manifest.from_lsn, high_lsn
                ),
            });
        }

        for record in read_records_file(&dir.join(INCREMENTAL_FILENAME))? {
            for op in record.ops {
                match op {
                    crate::log::RecordOp::Put(row) => {
                        rows.insert(row.row_key(), row);
                    }
                    crate::log::RecordOp::Delete { key, .. } => {
                        rows.remove(&key);
                    }
                }
            }
            high_lsn = high_lsn.max(record.lsn);
        }
        high_lsn = high_lsn.max(manifest.high_lsn);
    }

    fs::create_dir_all(merged_dir)?;
    let merged_rows: Vec<Row> = rows.into_values().collect();
    let row_count = merged_rows.len() as u64;
    write_checkpoint_file(
        &merged_dir.join(FULL_IMAGE_FILENAME),
        &Checkpoint {
            last_lsn: high_lsn,
            rows: merged_rows,
        },
    )?;

    let merged_id = Uuid::new_v4();
    BackupManifest {
        backup_id: merged_id,
        chain_root: merged_id,
        mode: BackupMode::Full,
        from_lsn: Lsn::ZERO,
        high_lsn,
        row_count,
        created_at_nanos: Timestamp::now().as_nanos(),
    }
    .save(merged_dir)?;

    Ok(())
}
