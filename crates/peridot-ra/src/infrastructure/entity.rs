//! Per-entity serialized execution with batched job items.
//!
//! The entity map owns one entry per entity (failover unit). Work arrives
//! as job items; the per-entity scheduler guarantees at most one executor
//! per entity and hands the executor every item batched while the entity
//! was locked. One execution cycle is one commit boundary:
//!
//! 1. acquire the entity's exclusive lock
//! 2. run each queued job item's `process` in insertion order against the
//!    in-memory snapshot
//! 3. if any item requested persistence, serialize the snapshot and commit
//!    it to the local store
//! 4. run each item's `finish_process` with the commit result
//! 5. hand the queued state-machine actions to the caller (dispatched only
//!    after the lock releases, and only if the commit succeeded)
//! 6. release the lock
//!
//! An entity marked deleted is removed from the map only after the delete
//! commits.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::ops::BitOr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use peridot_store::api::{KeyValueStoreApi, OperationKind, RowIdentifier, RowType};
use tracing::{debug, warn};

// ============================================================================
// Entity state contract
// ============================================================================

/// State stored in an entity entry.
pub trait EntityState: Clone + Send + 'static {
    /// Entity identifier.
    type Id: Clone + Eq + Hash + Display + Send + Sync + 'static;

    /// Action type emitted by job items against this entity.
    type Action: Send + 'static;

    fn id(&self) -> Self::Id;

    /// True once the entity has reached its terminal state and its record
    /// should be erased.
    fn is_deleted(&self) -> bool;

    /// True while the entity accepts failover work.
    fn is_open(&self) -> bool;

    fn row_type() -> RowType;

    fn persistence_id(&self) -> String;

    fn serialize(&self) -> Result<Vec<u8>, String>;
}

// ============================================================================
// Job items
// ============================================================================

/// Pre-execution checks; failing items are dropped without mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobItemCheck(u8);

impl JobItemCheck {
    pub const NONE: JobItemCheck = JobItemCheck(0);
    pub const RA_IS_OPEN: JobItemCheck = JobItemCheck(1);
    pub const FT_IS_NOT_NULL: JobItemCheck = JobItemCheck(2);
    pub const FT_IS_OPEN: JobItemCheck = JobItemCheck(4);
    pub const RA_IS_OPEN_OR_CLOSING: JobItemCheck = JobItemCheck(8);

    pub fn contains(self, other: JobItemCheck) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for JobItemCheck {
    type Output = JobItemCheck;

    fn bitor(self, rhs: JobItemCheck) -> JobItemCheck {
        JobItemCheck(self.0 | rhs.0)
    }
}

/// Agent-level state the checks evaluate against.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext {
    pub ra_is_open: bool,
    pub ra_is_closing: bool,
}

/// What a job item did to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobItemOutcome {
    /// Nothing changed.
    NoOp,

    /// In-memory change only; no persistence needed.
    InMemoryChange,

    /// The entity changed and must be committed (including deletion).
    Persist,
}

/// Result of the cycle's persistence step, passed to `finish_process`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    /// The snapshot committed (or nothing needed committing).
    Success,

    /// The commit failed; in-memory mutations were discarded.
    Failed(String),
}

impl CommitResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CommitResult::Success)
    }
}

/// A unit of work against one entity.
pub trait JobItem<T: EntityState>: Send {
    /// Checks evaluated before execution.
    fn checks(&self) -> JobItemCheck {
        JobItemCheck::NONE
    }

    /// Mutates the locked entity and queues actions.
    ///
    /// `entity` is `None` when the entity does not exist; an item may create
    /// it. Queued actions dispatch only if the cycle's commit succeeds.
    fn process(&self, entity: &mut Option<T>, actions: &mut Vec<T::Action>) -> JobItemOutcome;

    /// Runs after the commit step with its result.
    fn finish_process(&self, entity: &Option<T>, result: &CommitResult) {
        let _ = (entity, result);
    }

    /// Name for traces.
    fn name(&self) -> &'static str;
}

// ============================================================================
// Scheduler
// ============================================================================

/// Result of scheduling a job item.
#[derive(Debug, PartialEq, Eq)]
pub enum ScheduleResult {
    /// The caller acquired the entity lock and must run an execution cycle.
    Execute,

    /// The item was queued behind the current executor; it will run in that
    /// executor's (or a successor's) batch.
    Queued,
}

/// Result of releasing the entity lock.
#[derive(Debug, PartialEq, Eq)]
enum ReleaseResult {
    Idle,

    /// More work arrived while executing; the lock was retained and the
    /// caller must run another cycle.
    Rearmed,
}

struct SchedulerState<T: EntityState> {
    locked: bool,
    pending: Vec<Box<dyn JobItem<T>>>,
}

/// Per-entity queue with at-most-one executor.
pub struct EntityScheduler<T: EntityState> {
    state: Mutex<SchedulerState<T>>,
}

impl<T: EntityState> EntityScheduler<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                locked: false,
                pending: Vec::new(),
            }),
        }
    }

    /// Queues a job item, acquiring the entity lock if it is free.
    pub fn schedule(&self, item: Box<dyn JobItem<T>>) -> ScheduleResult {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.pending.push(item);
        if state.locked {
            ScheduleResult::Queued
        } else {
            state.locked = true;
            ScheduleResult::Execute
        }
    }

    /// Takes every queued item. Caller must hold the entity lock.
    fn take_pending(&self) -> Vec<Box<dyn JobItem<T>>> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        debug_assert!(state.locked, "taking pending work without the lock");
        std::mem::take(&mut state.pending)
    }

    /// Releases the lock, or retains it when more work is already queued.
    fn release(&self) -> ReleaseResult {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.pending.is_empty() {
            state.locked = false;
            ReleaseResult::Idle
        } else {
            ReleaseResult::Rearmed
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pending
            .len()
    }
}

impl<T: EntityState> Default for EntityScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Entity entry
// ============================================================================

struct EntityData<T> {
    state: Option<T>,

    /// Whether a row for this entity currently exists in the store.
    persisted: bool,
}

/// One entity: the mutable state plus its scheduler.
///
/// The entity map exclusively owns entries; lookups return shared handles;
/// mutation is gated by the scheduler.
pub struct EntityEntry<T: EntityState> {
    id: T::Id,
    data: Mutex<EntityData<T>>,
    scheduler: EntityScheduler<T>,
}

impl<T: EntityState> EntityEntry<T> {
    fn new(id: T::Id) -> Self {
        Self {
            id,
            data: Mutex::new(EntityData {
                state: None,
                persisted: false,
            }),
            scheduler: EntityScheduler::new(),
        }
    }

    fn with_state(id: T::Id, state: T, persisted: bool) -> Self {
        Self {
            id,
            data: Mutex::new(EntityData {
                state: Some(state),
                persisted,
            }),
            scheduler: EntityScheduler::new(),
        }
    }

    pub fn id(&self) -> &T::Id {
        &self.id
    }

    pub fn scheduler(&self) -> &EntityScheduler<T> {
        &self.scheduler
    }

    /// Snapshot of the current state (read-only observers).
    pub fn read(&self) -> Option<T> {
        self.data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .state
            .clone()
    }
}

// ============================================================================
// Execution cycle
// ============================================================================

/// Runs execution cycles for one entity.
pub struct ExecutionCycle;

impl ExecutionCycle {
    /// Runs one cycle. Returns the actions to dispatch and whether the
    /// entry should be removed from the map.
    fn run_once<T: EntityState>(
        entry: &EntityEntry<T>,
        store: &dyn KeyValueStoreApi,
        ctx: CheckContext,
        timeout: Duration,
    ) -> (Vec<T::Action>, bool) {
        let items = entry.scheduler.take_pending();
        let mut data = entry
            .data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Work on a snapshot so a failed commit discards the mutation.
        let mut snapshot = data.state.clone();
        let mut actions = Vec::new();
        let mut needs_persist = false;
        let mut runnable = Vec::with_capacity(items.len());

        for item in items {
            if !Self::passes_checks(item.checks(), ctx, snapshot.as_ref()) {
                debug!(entity = %entry.id, job = item.name(), "job item dropped by checks");
                continue;
            }
            match item.process(&mut snapshot, &mut actions) {
                JobItemOutcome::NoOp | JobItemOutcome::InMemoryChange => {}
                JobItemOutcome::Persist => needs_persist = true,
            }
            runnable.push(item);
        }

        let commit_result = if needs_persist {
            Self::commit(entry, store, &data, &snapshot, timeout)
        } else {
            CommitResult::Success
        };

        let mut remove_entry = false;
        match &commit_result {
            CommitResult::Success => {
                let deleted = snapshot.as_ref().is_none_or(EntityState::is_deleted);
                if needs_persist && deleted {
                    data.state = None;
                    data.persisted = false;
                    remove_entry = true;
                } else {
                    if needs_persist {
                        data.persisted = snapshot.is_some();
                    }
                    data.state = snapshot.clone();
                }
            }
            CommitResult::Failed(reason) => {
                warn!(entity = %entry.id, %reason, "entity commit failed, discarding mutation");
                actions.clear();
            }
        }

        for item in &runnable {
            item.finish_process(&data.state, &commit_result);
        }

        (actions, remove_entry)
    }

    fn passes_checks<T: EntityState>(
        checks: JobItemCheck,
        ctx: CheckContext,
        entity: Option<&T>,
    ) -> bool {
        if checks.contains(JobItemCheck::RA_IS_OPEN) && !ctx.ra_is_open {
            return false;
        }
        if checks.contains(JobItemCheck::RA_IS_OPEN_OR_CLOSING)
            && !(ctx.ra_is_open || ctx.ra_is_closing)
        {
            return false;
        }
        if checks.contains(JobItemCheck::FT_IS_NOT_NULL) && entity.is_none() {
            return false;
        }
        if checks.contains(JobItemCheck::FT_IS_OPEN) && !entity.is_some_and(EntityState::is_open) {
            return false;
        }
        true
    }

    fn commit<T: EntityState>(
        entry: &EntityEntry<T>,
        store: &dyn KeyValueStoreApi,
        data: &EntityData<T>,
        snapshot: &Option<T>,
        timeout: Duration,
    ) -> CommitResult {
        let deleted = snapshot.as_ref().is_none_or(EntityState::is_deleted);

        let result = if deleted {
            if data.persisted {
                let id = RowIdentifier::new(T::row_type(), entry.id.to_string());
                store
                    .store_operation(OperationKind::Delete, &id, bytes::Bytes::new(), timeout)
                    .map_err(|e| e.to_string())
            } else {
                Ok(())
            }
        } else {
            let state = snapshot.as_ref().expect("non-deleted snapshot has state");
            let id = RowIdentifier::new(T::row_type(), state.persistence_id());
            match state.serialize() {
                Ok(bytes) => {
                    let kind = if data.persisted {
                        OperationKind::Update
                    } else {
                        OperationKind::Insert
                    };
                    store
                        .store_operation(kind, &id, bytes::Bytes::from(bytes), timeout)
                        .map_err(|e| e.to_string())
                }
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => CommitResult::Success,
            Err(reason) => CommitResult::Failed(reason),
        }
    }
}

// ============================================================================
// Entity map
// ============================================================================

/// The map of all entities on the node.
///
/// Readers look up entries concurrently; inserts take the writer lock
/// briefly; entity-level mutation takes the per-entity scheduler lock,
/// never the map lock.
pub struct EntityMap<T: EntityState> {
    entries: RwLock<HashMap<T::Id, Arc<EntityEntry<T>>>>,
}

impl<T: EntityState> EntityMap<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &T::Id) -> Option<Arc<EntityEntry<T>>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn get_or_create(&self, id: &T::Id) -> Arc<EntityEntry<T>> {
        if let Some(entry) = self.get(id) {
            return entry;
        }
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .entry(id.clone())
            .or_insert_with(|| Arc::new(EntityEntry::new(id.clone())))
            .clone()
    }

    /// Seeds an entry from persisted state (LFUM load at boot).
    pub fn insert_persisted(&self, state: T) -> Arc<EntityEntry<T>> {
        let id = state.id();
        let entry = Arc::new(EntityEntry::with_state(id.clone(), state, true));
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, entry.clone());
        entry
    }

    pub fn ids(&self) -> Vec<T::Id> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: &T::Id) {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id);
    }

    /// Schedules a job item and, if this caller won the entity lock, runs
    /// execution cycles until the entity goes idle. Returns the actions to
    /// dispatch (empty when the item was queued behind another executor).
    pub fn schedule_and_execute(
        &self,
        entry: &Arc<EntityEntry<T>>,
        item: Box<dyn JobItem<T>>,
        store: &dyn KeyValueStoreApi,
        ctx: CheckContext,
        timeout: Duration,
    ) -> Vec<T::Action> {
        match entry.scheduler.schedule(item) {
            ScheduleResult::Queued => Vec::new(),
            ScheduleResult::Execute => self.execute(entry, store, ctx, timeout),
        }
    }

    fn execute(
        &self,
        entry: &Arc<EntityEntry<T>>,
        store: &dyn KeyValueStoreApi,
        ctx: CheckContext,
        timeout: Duration,
    ) -> Vec<T::Action> {
        let mut all_actions = Vec::new();
        loop {
            let (actions, remove_entry) = ExecutionCycle::run_once(entry, store, ctx, timeout);
            all_actions.extend(actions);
            if remove_entry {
                self.remove(&entry.id);
            }
            match entry.scheduler.release() {
                ReleaseResult::Idle => break,
                ReleaseResult::Rearmed => {}
            }
        }
        all_actions
    }
}

impl<T: EntityState> Default for EntityMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Multiple-entity work
// ============================================================================

/// Fan-out work across many entities with a completion callback invoked
/// after every child job item completes. Used by upgrade and node
/// deactivation.
pub struct MultipleEntityWork {
    remaining: Mutex<usize>,
    on_complete: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl MultipleEntityWork {
    pub fn new(child_count: usize, on_complete: impl FnOnce() + Send + 'static) -> Arc<Self> {
        let work = Arc::new(Self {
            remaining: Mutex::new(child_count),
            on_complete: Mutex::new(Some(Box::new(on_complete))),
        });
        if child_count == 0 {
            work.fire();
        }
        work
    }

    /// Marks one child complete; fires the callback when all are done.
    pub fn child_done(&self) {
        let mut remaining = self
            .remaining
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        debug_assert!(*remaining > 0, "child_done called more times than children");
        *remaining -= 1;
        let done = *remaining == 0;
        drop(remaining);
        if done {
            self.fire();
        }
    }

    fn fire(&self) {
        if let Some(cb) = self
            .on_complete
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            cb();
        }
    }
}
