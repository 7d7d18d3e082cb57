//! Append-only commit log with checkpoint support and segment rotation.
//!
//! Every committed transaction appends one [`CommitRecord`] to the active
//! segment and flushes before the commit is acknowledged. Completed segments
//! are immutable. A checkpoint persists the full row image at a given LSN so
//! that segments wholly below it can be removed (log truncation).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use peridot_types::Lsn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{DecodedFrame, decode_frame, encode_frame};
use crate::row::{Row, RowKey};
use crate::StoreError;

/// Manifest filename for segment metadata.
const MANIFEST_FILENAME: &str = "manifest.json";

/// Checkpoint filename (full row image).
const CHECKPOINT_FILENAME: &str = "checkpoint.db";

/// Formats a segment filename from its number.
fn segment_filename(segment_num: u32) -> String {
    format!("log_{segment_num:06}.plog")
}

// ============================================================================
// Commit Record
// ============================================================================

/// One operation inside a commit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum RecordOp {
    /// Insert or overwrite a row (the row carries its final LSN).
    Put(Row),

    /// Physically remove a row. The LSN is the commit that removed it.
    Delete { key: RowKey, lsn: Lsn },
}

/// The unit of durability: all operations of one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CommitRecord {
    /// Commit LSN assigned to the transaction.
    pub lsn: Lsn,
    pub ops: Vec<RecordOp>,
}

// ============================================================================
// Manifest
// ============================================================================

/// Metadata for a single log segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SegmentMeta {
    pub segment_num: u32,

    /// Highest commit LSN recorded in this segment (ZERO while empty).
    pub last_lsn: Lsn,

    pub size_bytes: u64,
}

/// Durable backup chain bookkeeping.
///
/// An incremental backup must reference the chain of the prior full backup;
/// the engine records the chain root and the high LSN of the last archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BackupChainState {
    pub root: Uuid,
    pub last_backup_lsn: Lsn,
}

/// Engine manifest tracking the checkpoint, segments and backup chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Manifest {
    /// Rows with `lsn <= checkpoint_lsn` live in the checkpoint image.
    pub checkpoint_lsn: Lsn,

    /// Ordered list of segments (ascending by `segment_num`).
    pub segments: Vec<SegmentMeta>,

    /// The currently active (writable) segment number.
    pub active_segment: u32,

    pub backup_chain: Option<BackupChainState>,
}

impl Manifest {
    fn new() -> Self {
        Self {
            checkpoint_lsn: Lsn::ZERO,
            segments: vec![SegmentMeta {
                segment_num: 1,
                last_lsn: Lsn::ZERO,
                size_bytes: 0,
            }],
            active_segment: 1,
            backup_chain: None,
        }
    }

    fn save(&self, dir: &Path) -> Result<(), StoreError> {
        let path = dir.join(MANIFEST_FILENAME);
        let json = serde_json::to_string_pretty(self).map_err(|e| StoreError::Manifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&path, json)?;
        Ok(())
    }

    fn load(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(MANIFEST_FILENAME);
        let json = fs::read_to_string(&path)?;
        serde_json::from_str(&json).map_err(|e| StoreError::Manifest {
            path,
            reason: e.to_string(),
        })
    }

    fn active_mut(&mut self) -> &mut SegmentMeta {
        let active = self.active_segment;
        self.segments
            .iter_mut()
            .find(|s| s.segment_num == active)
            .expect("active segment must exist in manifest")
    }
}

// ============================================================================
// Checkpoint
// ============================================================================

/// Full row image at a checkpoint LSN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Checkpoint {
    pub last_lsn: Lsn,
    pub rows: Vec<Row>,
}

pub(crate) fn write_checkpoint_file(path: &Path, checkpoint: &Checkpoint) -> Result<(), StoreError> {
    let bytes = postcard::to_allocvec(checkpoint)?;
    let framed = encode_frame(&bytes);
    let tmp = path.with_extension("db.tmp");
    fs::write(&tmp, framed)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn read_checkpoint_file(path: &Path) -> Result<Checkpoint, StoreError> {
    let buf = fs::read(path)?;
    match decode_frame(&buf)? {
        DecodedFrame::Complete { payload, .. } => Ok(postcard::from_bytes(&payload)?),
        DecodedFrame::Torn => Err(StoreError::CorruptStore {
            reason: format!("truncated checkpoint at {}", path.display()),
        }),
    }
}

// ============================================================================
// Commit Log
// ============================================================================

/// The engine's durable commit log.
pub(crate) struct CommitLog {
    dir: PathBuf,
    manifest: Manifest,
    active: File,
    max_segment_bytes: u64,
}

impl CommitLog {
    /// Opens (or creates) the log under `dir` and replays state.
    ///
    /// Returns the log handle, the checkpoint (if any) and all records past
    /// the checkpoint in commit order. A torn frame at the tail of the active
    /// segment is discarded; a torn frame anywhere else is corruption.
    pub fn open(
        dir: &Path,
        max_segment_bytes: u64,
    ) -> Result<(Self, Option<Checkpoint>, Vec<CommitRecord>), StoreError> {
        fs::create_dir_all(dir)?;

        let manifest_exists = dir.join(MANIFEST_FILENAME).exists();
        let manifest = if manifest_exists {
            Manifest::load(dir)?
        } else {
            let m = Manifest::new();
            m.save(dir)?;
            m
        };

        let checkpoint_path = dir.join(CHECKPOINT_FILENAME);
        let checkpoint = if checkpoint_path.exists() {
            Some(read_checkpoint_file(&checkpoint_path)?)
        } else {
            None
        };

        let mut records = Vec::new();
        let last_index = manifest.segments.len().saturating_sub(1);
        for (i, seg) in manifest.segments.iter().enumerate() {
            let path = dir.join(segment_filename(seg.segment_num));
            if !path.exists() {
                if seg.size_bytes == 0 {
                    continue;
                }
                return Err(StoreError::CorruptStore {
                    reason: format!("missing log segment {}", path.display()),
                });
            }
            let is_active = i == last_index;
            records.extend(Self::replay_segment(&path, is_active)?);
        }

        let active_path = dir.join(segment_filename(manifest.active_segment));
        let active = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)?;

        Ok((
            Self {
                dir: dir.to_path_buf(),
                manifest,
                active,
                max_segment_bytes,
            },
            checkpoint,
            records,
        ))
    }

    fn replay_segment(path: &Path, tolerate_torn_tail: bool) -> Result<Vec<CommitRecord>, StoreError> {
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
                    if tolerate_torn_tail {
                        tracing::warn!(
                            segment = %path.display(),
                            offset = pos,
                            "discarding torn record at log tail"
                        );
                        break;
                    }
                    return Err(StoreError::CorruptStore {
                        reason: format!("torn record inside sealed segment {}", path.display()),
                    });
                }
            }
        }

        Ok(records)
    }

    /// Appends one commit record and flushes it to disk.
    pub fn append(&mut self, record: &CommitRecord) -> Result<(), StoreError> {
        let payload = postcard::to_allocvec(record)?;
        let framed = encode_frame(&payload);

        self.active.write_all(&framed)?;
        self.active.sync_data()?;

        {
            let active = self.manifest.active_mut();
            active.size_bytes += framed.len() as u64;
            active.last_lsn = active.last_lsn.max(record.lsn);
        }

        if self.manifest.active_mut().size_bytes >= self.max_segment_bytes {
            self.rotate()?;
        } else {
            self.manifest.save(&self.dir)?;
        }

        Ok(())
    }

    /// Seals the active segment and starts a new one.
    fn rotate(&mut self) -> Result<(), StoreError> {
        let next = self.manifest.active_segment + 1;
        self.manifest.segments.push(SegmentMeta {
            segment_num: next,
            last_lsn: Lsn::ZERO,
            size_bytes: 0,
        });
        self.manifest.active_segment = next;
        self.manifest.save(&self.dir)?;

        let path = self.dir.join(segment_filename(next));
        self.active = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(())
    }

    /// Writes a checkpoint at `last_lsn` and removes segments wholly covered
    /// by it. The active segment is always retained.
    pub fn checkpoint(&mut self, rows: Vec<Row>, last_lsn: Lsn) -> Result<(), StoreError> {
        write_checkpoint_file(
            &self.dir.join(CHECKPOINT_FILENAME),
            &Checkpoint { last_lsn, rows },
        )?;
        self.manifest.checkpoint_lsn = last_lsn;

        let active = self.manifest.active_segment;
        let (covered, kept): (Vec<SegmentMeta>, Vec<SegmentMeta>) = self
            .manifest
            .segments
            .drain(..)
            .partition(|s| s.segment_num != active && s.last_lsn <= last_lsn);
        self.manifest.segments = kept;

        for seg in covered {
            let path = self.dir.join(segment_filename(seg.segment_num));
            if path.exists() {
                fs::remove_file(path)?;
            }
        }

        self.manifest.save(&self.dir)?;
        Ok(())
    }

    /// Reads all records with `lsn > from_lsn` in commit order.
    ///
    /// Used by incremental backup; rows below the current checkpoint may no
    /// longer be readable, in which case the chain is unusable.
    pub fn records_after(&self, from_lsn: Lsn) -> Result<Vec<CommitRecord>, StoreError> {
        if self.manifest.checkpoint_lsn > from_lsn {
            return Err(StoreError::InvalidBackupChain {
                reason: format!(
                    "log truncated past requested lsn (checkpoint {} > from {from_lsn})",
                    self.manifest.checkpoint_lsn
                ),
            });
        }

        let mut out = Vec::new();
        let last_index = self.manifest.segments.len().saturating_sub(1);
        for (i, seg) in self.manifest.segments.iter().enumerate() {
            let path = self.dir.join(segment_filename(seg.segment_num));
            if !path.exists() {
                continue;
            }
            for record in Self::replay_segment(&path, i == last_index)? {
                if record.lsn > from_lsn {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    pub fn backup_chain(&self) -> Option<BackupChainState> {
        self.manifest.backup_chain
    }

    pub fn set_backup_chain(&mut self, chain: Option<BackupChainState>) -> Result<(), StoreError> {
        self.manifest.backup_chain = chain;
        self.manifest.save(&self.dir)
    }

    /// Total bytes across live segments plus the checkpoint image.
    pub fn size_bytes(&self) -> u64 {
        let segments: u64 = self.manifest.segments.iter().map(|s| s.size_bytes).sum();
        let checkpoint = fs::metadata(self.dir.join(CHECKPOINT_FILENAME))
            .map(|m| m.len())
            .unwrap_or(0);
        segments + checkpoint
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
