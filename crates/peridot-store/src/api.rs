//! Typed storage API layer.
//!
//! The reconfiguration agent persists its entities through this thin
//! abstraction around a key-value store. Each row has a typed identifier and
//! opaque serialized data. Implementations:
//!
//! - [`LocalStoreAdapter`]: translates the engine contract into this
//!   interface (the production path)
//! - [`InMemoryKeyValueStore`]: map-backed implementation for tests
//!
//! Inconsistent operations (delete of a missing row, duplicate insert,
//! update of a missing row) indicate a broken invariant in the calling state
//! machine, so they surface `ContractViolation` rather than a retryable
//! error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::error;

use crate::engine::{Isolation, LocalStore};
use crate::StoreError;

// ============================================================================
// Row identity
// ============================================================================

/// The row types the reconfiguration agent stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowType {
    Invalid,
    FailoverUnit,
    Tombstone,
    Test,
}

impl RowType {
    /// The string form used as the engine-level row type.
    pub fn as_str(self) -> &'static str {
        match self {
            RowType::Invalid => "Invalid",
            RowType::FailoverUnit => "FailoverUnit",
            RowType::Tombstone => "Tombstone",
            RowType::Test => "Test",
        }
    }
}

impl std::fmt::Display for RowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed identifier of a stored row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowIdentifier {
    row_type: RowType,
    id: String,
}

impl RowIdentifier {
    pub fn new(row_type: RowType, id: impl Into<String>) -> Self {
        Self {
            row_type,
            id: id.into(),
        }
    }

    pub fn row_type(&self) -> RowType {
        self.row_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for RowIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.row_type, self.id)
    }
}

/// A typed row returned by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRow {
    pub id: RowIdentifier,
    pub data: Bytes,
}

/// The kind of mutation applied through the typed API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

// ============================================================================
// Store interface
// ============================================================================

/// The RA abstraction around a key-value store.
///
/// Concurrent calls for different ids must succeed; concurrent non-insert
/// calls for the same id are undefined; for insert-insert races one caller
/// wins and the other observes a conflict.
pub trait KeyValueStoreApi: Send + Sync {
    /// Returns all rows of `row_type`.
    fn enumerate(&self, row_type: RowType) -> Result<Vec<ApiRow>, StoreError>;

    /// Applies one mutation to the row identified by `id`.
    fn store_operation(
        &self,
        kind: OperationKind,
        id: &RowIdentifier,
        data: Bytes,
        timeout: Duration,
    ) -> Result<(), StoreError>;

    fn close(&self);
}

// ============================================================================
// Local store adapter
// ============================================================================

/// Production implementation over the engine contract.
pub struct LocalStoreAdapter<S: LocalStore> {
    store: Arc<S>,
}

impl<S: LocalStore> LocalStoreAdapter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn violated(kind: OperationKind, id: &RowIdentifier, cause: &StoreError) -> StoreError {
        error!(%id, ?kind, %cause, "typed store operation violated a storage invariant");
        StoreError::ContractViolation(format!("{kind:?} of {id} failed: {cause}"))
    }
}

impl<S: LocalStore> KeyValueStoreApi for LocalStoreAdapter<S> {
    fn enumerate(&self, row_type: RowType) -> Result<Vec<ApiRow>, StoreError> {
        let tx = self.store.begin_transaction(Isolation::ReadCommitted)?;
        let cursor = self
            .store
            .enumerate_by_type_and_key(&tx, row_type.as_str(), "")?;
        let rows = cursor
            .map(|row| ApiRow {
                id: RowIdentifier::new(row_type, row.key.clone()),
                data: row.value,
            })
            .collect();
        Ok(rows)
    }

    fn store_operation(
        &self,
        kind: OperationKind,
        id: &RowIdentifier,
        data: Bytes,
        timeout: Duration,
    ) -> Result<(), StoreError> {
        let mut tx = self.store.begin_transaction(Isolation::ReadCommitted)?;

        let result = match kind {
            OperationKind::Insert => {
                self.store
                    .insert(&mut tx, id.row_type().as_str(), id.id(), data, None)
            }
            OperationKind::Update => self.store.update(
                &mut tx,
                id.row_type().as_str(),
                id.id(),
                None,
                None,
                data,
                None,
            ),
            OperationKind::Delete => {
                self.store
                    .delete(&mut tx, id.row_type().as_str(), id.id(), None)
            }
        };

        match result {
            Ok(()) => {
                self.store.commit(&mut tx, timeout)?;
                Ok(())
            }
            Err(e @ (StoreError::NotFound { .. } | StoreError::KeyExists { .. })) => {
                self.store.rollback(&mut tx);
                Err(Self::violated(kind, id, &e))
            }
            Err(e) => {
                self.store.rollback(&mut tx);
                Err(e)
            }
        }
    }

    fn close(&self) {
        let _ = self.store.close();
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// Map-backed implementation for unit tests of the reconfiguration agent.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    state: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    rows: HashMap<RowIdentifier, Bytes>,
    closed: bool,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all row data keyed by id (test assertions).
    pub fn dump(&self) -> HashMap<RowIdentifier, Bytes> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).rows.clone()
    }
}

impl KeyValueStoreApi for InMemoryKeyValueStore {
    fn enumerate(&self, row_type: RowType) -> Result<Vec<ApiRow>, StoreError> {
        let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.closed {
            return Err(StoreError::ObjectClosed);
        }
        let mut rows: Vec<ApiRow> = state
            .rows
            .iter()
            .filter(|(id, _)| id.row_type() == row_type)
            .map(|(id, data)| ApiRow {
                id: id.clone(),
                data: data.clone(),
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    fn store_operation(
        &self,
        kind: OperationKind,
        id: &RowIdentifier,
        data: Bytes,
        timeout: Duration,
    ) -> Result<(), StoreError> {
        let _ = timeout;
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.closed {
            return Err(StoreError::ObjectClosed);
        }

        match kind {
            OperationKind::Insert => {
                if state.rows.contains_key(id) {
                    return Err(StoreError::ContractViolation(format!(
                        "insert of existing row {id}"
                    )));
                }
                state.rows.insert(id.clone(), data);
            }
            OperationKind::Update => {
                if !state.rows.contains_key(id) {
                    return Err(StoreError::ContractViolation(format!(
                        "update of missing row {id}"
                    )));
                }
                state.rows.insert(id.clone(), data);
            }
            OperationKind::Delete => {
                if state.rows.remove(id).is_none() {
                    return Err(StoreError::ContractViolation(format!(
                        "delete of missing row {id}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> RowIdentifier {
        RowIdentifier::new(RowType::Test, s)
    }

    #[test]
    fn in_memory_insert_update_delete() {
        let store = InMemoryKeyValueStore::new();
        let timeout = Duration::from_secs(1);

        store
            .store_operation(OperationKind::Insert, &id("a"), Bytes::from_static(b"1"), timeout)
            .unwrap();
        store
            .store_operation(OperationKind::Update, &id("a"), Bytes::from_static(b"2"), timeout)
            .unwrap();

        let rows = store.enumerate(RowType::Test).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data, Bytes::from_static(b"2"));

        store
            .store_operation(OperationKind::Delete, &id("a"), Bytes::new(), timeout)
            .unwrap();
        assert!(store.enumerate(RowType::Test).unwrap().is_empty());
    }

    #[test]
    fn inconsistent_operations_are_contract_violations() {
        let store = InMemoryKeyValueStore::new();
        let timeout = Duration::from_secs(1);

        let err = store
            .store_operation(OperationKind::Delete, &id("missing"), Bytes::new(), timeout)
            .unwrap_err();
        assert!(matches!(err, StoreError::ContractViolation(_)));

        store
            .store_operation(OperationKind::Insert, &id("a"), Bytes::from_static(b"1"), timeout)
            .unwrap();
        let err = store
            .store_operation(OperationKind::Insert, &id("a"), Bytes::from_static(b"1"), timeout)
            .unwrap_err();
        assert!(matches!(err, StoreError::ContractViolation(_)));
    }

    #[test]
    fn closed_store_rejects_operations() {
        let store = InMemoryKeyValueStore::new();
        store.close();
        assert!(matches!(
            store.enumerate(RowType::Test),
            Err(StoreError::ObjectClosed)
        ));
    }
}
