//! Local store engine settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tuning and placement settings for the local storage engine.
///
/// Loaded from configuration; every field has a usable default so embedded
/// and test stores can construct settings with only a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStoreSettings {
    /// Root working directory for this store instance.
    pub working_directory: PathBuf,

    /// Directory holding the engine's files (defaults under the working
    /// directory).
    pub database_directory: PathBuf,

    /// Commit log segment rotation threshold.
    pub log_file_size_kb: u64,

    pub log_buffer_size_kb: u64,

    /// Bounds concurrently active transactions (cursor snapshots are
    /// materialized, so this is the engine's open-handle budget).
    pub max_cursors: usize,

    pub max_ver_pages: u32,
    pub max_async_commit_delay_ms: u64,
    pub cache_min_mb: u64,
    pub cache_max_mb: u64,
    pub page_size_kb: u64,
    pub defrag_threshold_mb: u64,
    pub compaction_threshold_mb: u64,

    /// Values at or below this size are stored inline with the row.
    pub intrinsic_value_threshold_bytes: usize,

    pub enable_incremental_backup: bool,

    /// When set, fatal engine errors abort the process instead of returning
    /// `CorruptStore` to the caller.
    pub assert_on_fatal_error: bool,
}

impl Default for LocalStoreSettings {
    fn default() -> Self {
        Self {
            working_directory: PathBuf::from(".peridot"),
            database_directory: PathBuf::from(".peridot/data"),
            log_file_size_kb: 5 * 1024,
            log_buffer_size_kb: 1024,
            max_cursors: 4096,
            max_ver_pages: 16384,
            max_async_commit_delay_ms: 200,
            cache_min_mb: 16,
            cache_max_mb: 256,
            page_size_kb: 8,
            defrag_threshold_mb: 64,
            compaction_threshold_mb: 512,
            intrinsic_value_threshold_bytes: 1024,
            enable_incremental_backup: false,
            assert_on_fatal_error: false,
        }
    }
}

impl LocalStoreSettings {
    /// Settings rooted at `dir`, everything else default.
    pub fn in_directory(dir: impl Into<PathBuf>) -> Self {
        let working: PathBuf = dir.into();
        Self {
            database_directory: working.join("data"),
            working_directory: working,
            ..Self::default()
        }
    }

    pub fn with_incremental_backup(mut self, enabled: bool) -> Self {
        self.enable_incremental_backup = enabled;
        self
    }
}
