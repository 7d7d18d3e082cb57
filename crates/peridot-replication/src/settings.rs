//! Replicated store settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::notification::SecondaryNotificationMode;

/// How a full copy is performed when a secondary must be (re)built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FullCopyMode {
    /// Choose by gap size against `full_copy_threshold_rows`.
    #[default]
    Default,

    /// Stream the engine-native image.
    Physical,

    /// Stream row-level operations.
    Logical,

    /// Send a full snapshot and reset the secondary.
    Rebuild,
}

/// Tuning for the replicated store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatedStoreSettings {
    /// Simple transactions arriving within this window are batch-committed.
    /// Zero disables batching.
    pub commit_batching_period_ms: u64,

    /// Flush the simple-transaction batch at this many operations.
    pub commit_batching_size_limit: usize,

    pub transaction_low_watermark: usize,
    pub transaction_high_watermark: usize,

    /// Replication queue throttle: operation-count high watermark.
    pub throttle_replication_queue_operation_count: usize,

    /// Replication queue throttle: byte-size high watermark.
    pub throttle_replication_queue_size_bytes: u64,

    pub enable_stream_faults: bool,
    pub enable_flush_on_drain: bool,

    pub secondary_notification_mode: SecondaryNotificationMode,

    /// How long `close` waits for in-flight transactions to drain.
    pub transaction_drain_timeout_ms: u64,

    pub enable_copy_notification_prefetch: bool,

    /// Row types prefetched into copy notifications.
    pub copy_notification_prefetch_types: Vec<String>,

    /// Enables the cursor-aware tombstone cleanup pass.
    pub enable_tombstone_cleanup2: bool,

    /// Tombstones younger than this never get cleaned up.
    pub tombstone_retention_ms: u64,

    pub full_copy_mode: FullCopyMode,

    /// Gap size (in rows) past which `FullCopyMode::Default` selects a
    /// rebuild instead of a logical stream.
    pub full_copy_threshold_rows: u64,

    /// Interval between scheduled log truncations on engines that need them.
    pub log_truncation_interval_ms: u64,
}

impl Default for ReplicatedStoreSettings {
    fn default() -> Self {
        Self {
            commit_batching_period_ms: 0,
            commit_batching_size_limit: 128,
            transaction_low_watermark: 256,
            transaction_high_watermark: 1024,
            throttle_replication_queue_operation_count: 4096,
            throttle_replication_queue_size_bytes: 64 * 1024 * 1024,
            enable_stream_faults: false,
            enable_flush_on_drain: false,
            secondary_notification_mode: SecondaryNotificationMode::NonBlockingQuorumAcked,
            transaction_drain_timeout_ms: 30_000,
            enable_copy_notification_prefetch: false,
            copy_notification_prefetch_types: Vec::new(),
            enable_tombstone_cleanup2: true,
            tombstone_retention_ms: 0,
            full_copy_mode: FullCopyMode::Default,
            full_copy_threshold_rows: 1024,
            log_truncation_interval_ms: 60_000,
        }
    }
}

impl ReplicatedStoreSettings {
    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_millis(self.tombstone_retention_ms)
    }

    pub fn transaction_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_drain_timeout_ms)
    }
}
