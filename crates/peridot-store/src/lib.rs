//! Local key-value storage engine for Peridot.
//!
//! This crate provides the durable, per-replica storage layer:
//!
//! - [`Row`]: the storage primitive, a `(type, key)`-addressed value tagged
//!   with the commit LSN of the transaction that last modified it
//! - [`LocalStore`]: the engine contract (transactions, typed CRUD with
//!   optimistic concurrency, LSN-ordered enumeration, backup/restore)
//! - [`LogKvStore`]: the log-structured engine implementation
//! - [`api`]: the thin typed storage layer used by the reconfiguration agent
//!
//! # Durability
//!
//! The engine is log-structured: every commit appends one checksummed record
//! to the active commit log segment and flushes it before the commit is
//! acknowledged. On open, the engine loads the latest checkpoint and replays
//! the segments past it. Segments rotate at a configured size; a checkpoint
//! plus the segment list is tracked in `manifest.json`.
//!
//! # File Layout
//!
//! ```text
//! {database_directory}/
//! ├── manifest.json        <- checkpoint + segment ranges + backup chain
//! ├── checkpoint.db        <- full row image at a checkpoint LSN
//! ├── log_000001.plog      <- commit log segments (checksummed records)
//! └── log_000002.plog
//! ```

mod backup;
mod codec;
mod engine;
mod kv;
mod log;
mod row;
mod settings;

pub mod api;

pub use backup::{BackupManifest, BackupMode};
pub use engine::{Isolation, LocalStore, RowCursor, Transaction, TxState};
pub use kv::LogKvStore;
pub use row::{Row, RowKey};
pub use settings::LocalStoreSettings;

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the local storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Insert of a `(type, key)` pair that already exists.
    #[error("row already exists: {row_type}:{key}")]
    KeyExists { row_type: String, key: String },

    /// The addressed row does not exist.
    #[error("row not found: {row_type}:{key}")]
    NotFound { row_type: String, key: String },

    /// Optimistic concurrency check failed: the row's LSN no longer matches.
    #[error("write conflict on {row_type}:{key}: expected lsn {expected}, found {actual}")]
    WriteConflict {
        row_type: String,
        key: String,
        expected: peridot_types::Lsn,
        actual: peridot_types::Lsn,
    },

    /// Two transactions raced for the same row lock. The younger transaction
    /// is aborted; the caller retries.
    #[error("deadlock detected on {row_type}:{key}")]
    DeadlockDetected { row_type: String, key: String },

    /// The engine is at a resource limit (open cursors, transactions).
    #[error("store busy: {0}")]
    StoreBusy(&'static str),

    /// The operation did not complete within the caller's timeout.
    #[error("store operation timed out")]
    Timeout,

    /// Checksum mismatch or unreadable on-disk state.
    #[error("corrupt store: {reason}")]
    CorruptStore { reason: String },

    /// The store has been closed.
    #[error("store is closed")]
    ObjectClosed,

    /// A backup chain is unusable (missing root, out-of-order links).
    #[error("invalid backup chain: {reason}")]
    InvalidBackupChain { reason: String },

    /// Incremental backup requested without a full backup in the chain, or
    /// with incremental backup disabled.
    #[error("incremental backup unavailable: {reason}")]
    IncrementalBackupUnavailable { reason: &'static str },

    /// A higher-layer invariant was violated (delete of a nonexistent row,
    /// duplicate insert through the typed API).
    #[error("storage contract violation: {0}")]
    ContractViolation(String),

    /// Transaction handle used after commit, rollback or abort.
    #[error("transaction is not active")]
    TransactionNotActive,

    #[error("serialization failed: {0}")]
    Codec(#[from] postcard::Error),

    #[error("manifest error at {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Classifies this error for the retry and escalation machinery.
    pub fn classify(&self) -> peridot_types::ErrorClass {
        use peridot_types::ErrorClass;
        match self {
            // A closing store is transient from the caller's view: the
            // replica reopens or the retry lands elsewhere.
            StoreError::Timeout
            | StoreError::StoreBusy(_)
            | StoreError::WriteConflict { .. }
            | StoreError::DeadlockDetected { .. }
            | StoreError::ObjectClosed => ErrorClass::Retryable,
            StoreError::CorruptStore { .. }
            | StoreError::ContractViolation(_)
            | StoreError::TransactionNotActive
            | StoreError::Codec(_)
            | StoreError::Manifest { .. } => ErrorClass::Fatal,
            StoreError::NotFound { .. }
            | StoreError::KeyExists { .. }
            | StoreError::InvalidBackupChain { .. }
            | StoreError::IncrementalBackupUnavailable { .. } => ErrorClass::Informational,
            StoreError::Io(_) => ErrorClass::DropWorthy,
        }
    }

    /// True if the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        self.classify() == peridot_types::ErrorClass::Retryable
    }

    /// True if the replica hosting this store must be reset or dropped.
    pub fn is_fatal(&self) -> bool {
        self.classify() == peridot_types::ErrorClass::Fatal
    }

    pub(crate) fn not_found(row_type: &str, key: &str) -> Self {
        StoreError::NotFound {
            row_type: row_type.to_string(),
            key: key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests;
