//! Copy (catch-up) streams for joining secondaries.
//!
//! When a secondary joins or has fallen behind the replication queue, the
//! primary builds a **copy context**: a stable snapshot of every row the
//! joiner is missing, streamed in LSN order. The stream is resumable: on
//! failure the secondary re-requests from its current acknowledged LSN and
//! the primary builds a fresh context from there.
//!
//! Every live context registers its floor LSN in the cursor registry;
//! tombstone cleanup consults the registry so no tombstone a live cursor
//! may still observe is removed. Context creation and cleanup serialize on
//! the same lock.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use peridot_types::Lsn;
use peridot_store::Row;
use serde::{Deserialize, Serialize};

use crate::settings::FullCopyMode;

/// The resolved transfer mode of one copy context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyMode {
    /// Engine-native image stream (fastest; resets the target).
    Physical,

    /// Row-level operations with `lsn > joiner_lsn`, tombstones included.
    Logical,

    /// Full snapshot; the target is reset before apply.
    Rebuild,
}

/// Resolves the configured mode against the joiner's gap.
pub(crate) fn resolve_mode(configured: FullCopyMode, gap_rows: u64, threshold_rows: u64) -> CopyMode {
    match configured {
        FullCopyMode::Physical => CopyMode::Physical,
        FullCopyMode::Logical => CopyMode::Logical,
        FullCopyMode::Rebuild => CopyMode::Rebuild,
        FullCopyMode::Default => {
            if gap_rows > threshold_rows {
                CopyMode::Rebuild
            } else {
                CopyMode::Logical
            }
        }
    }
}

/// Summary of a copy context (for query status and traces).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
    pub mode: CopyMode,
    pub item_count: usize,
    pub snapshot_lsn: Lsn,
}

// ============================================================================
// Cursor registry
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct CursorRegistry {
    next_id: u64,
    floors: HashMap<u64, Lsn>,
}

impl CursorRegistry {
    pub fn register(&mut self, floor: Lsn) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.floors.insert(id, floor);
        id
    }

    pub fn deregister(&mut self, id: u64) {
        self.floors.remove(&id);
    }

    /// The lowest floor across active cursors, if any are live.
    pub fn min_floor(&self) -> Option<Lsn> {
        self.floors.values().copied().min()
    }

    pub fn active(&self) -> usize {
        self.floors.len()
    }
}

/// Shared registry; the lock also serializes copy-context creation with
/// tombstone cleanup.
#[derive(Debug, Default, Clone)]
pub(crate) struct CopyManager {
    registry: Arc<Mutex<CursorRegistry>>,
}

impl CopyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, CursorRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ============================================================================
// Copy context
// ============================================================================

/// A primary-side copy stream for one joining secondary.
///
/// The context holds a stable snapshot taken at creation; dropping it
/// releases its cursor registration.
pub struct CopyContext {
    cursor_id: u64,
    manager: CopyManager,

    mode: CopyMode,
    joiner_lsn: Lsn,
    snapshot_lsn: Lsn,
    items: VecDeque<Row>,
}

impl CopyContext {
    pub(crate) fn new(
        manager: CopyManager,
        cursor_id: u64,
        mode: CopyMode,
        joiner_lsn: Lsn,
        snapshot_lsn: Lsn,
        items: Vec<Row>,
    ) -> Self {
        Self {
            cursor_id,
            manager,
            mode,
            joiner_lsn,
            snapshot_lsn,
            items: items.into(),
        }
    }

    pub fn mode(&self) -> CopyMode {
        self.mode
    }

    pub fn joiner_lsn(&self) -> Lsn {
        self.joiner_lsn
    }

    /// The LSN the secondary reaches once the stream fully applies.
    pub fn snapshot_lsn(&self) -> Lsn {
        self.snapshot_lsn
    }

    pub fn stats(&self) -> CopyStats {
        CopyStats {
            mode: self.mode,
            item_count: self.items.len(),
            snapshot_lsn: self.snapshot_lsn,
        }
    }

    /// Pops the next batch of at most `max` rows, in LSN order.
    pub fn next_batch(&mut self, max: usize) -> Vec<Row> {
        let take = max.min(self.items.len());
        self.items.drain(..take).collect()
    }

    pub fn is_drained(&self) -> bool {
        self.items.is_empty()
    }
}

impl Iterator for CopyContext {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.items.pop_front()
    }
}

impl Drop for CopyContext {
    fn drop(&mut self) {
        self.manager.lock().deregister(self.cursor_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(FullCopyMode::Logical, 10_000, CopyMode::Logical; "forced logical")]
    #[test_case(FullCopyMode::Rebuild, 1, CopyMode::Rebuild; "forced rebuild")]
    #[test_case(FullCopyMode::Physical, 1, CopyMode::Physical; "forced physical")]
    #[test_case(FullCopyMode::Default, 10, CopyMode::Logical; "default small gap")]
    #[test_case(FullCopyMode::Default, 5000, CopyMode::Rebuild; "default large gap")]
    fn mode_resolution(configured: FullCopyMode, gap: u64, expected: CopyMode) {
        assert_eq!(resolve_mode(configured, gap, 1024), expected);
    }

    #[test]
    fn registry_tracks_min_floor() {
        let manager = CopyManager::new();
        let a = manager.lock().register(Lsn::new(5));
        let _b = manager.lock().register(Lsn::new(2));
        assert_eq!(manager.lock().min_floor(), Some(Lsn::new(2)));

        manager.lock().deregister(a);
        assert_eq!(manager.lock().min_floor(), Some(Lsn::new(2)));
    }

    #[test]
    fn dropping_context_releases_cursor() {
        let manager = CopyManager::new();
        let id = manager.lock().register(Lsn::new(3));
        let ctx = CopyContext::new(
            manager.clone(),
            id,
            CopyMode::Logical,
            Lsn::new(3),
            Lsn::new(9),
            vec![],
        );
        assert_eq!(manager.lock().active(), 1);
        drop(ctx);
        assert_eq!(manager.lock().active(), 0);
    }
}
