//! Row type for the key-value engine.
//!
//! A row is the storage primitive: a value addressed by `(type, key)` and
//! tagged with the LSN of the transaction that last modified it. The
//! `(type, key)` pair is the primary key.

use bytes::Bytes;
use peridot_types::{Lsn, Timestamp};
use serde::{Deserialize, Serialize};

/// Primary key of a row: the `(type, key)` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey {
    pub row_type: String,
    pub key: String,
}

impl RowKey {
    pub fn new(row_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            row_type: row_type.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.row_type, self.key)
    }
}

/// A single row in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub row_type: String,
    pub key: String,
    pub value: Bytes,

    /// Commit LSN of the transaction that last modified this row.
    pub operation_lsn: Lsn,

    /// When this replica last modified the row.
    pub last_modified_utc: Timestamp,

    /// When the primary last modified the row. Carried unchanged through
    /// replication and copy so secondaries report primary time.
    pub last_modified_on_primary_utc: Timestamp,
}

impl Row {
    pub fn new(row_type: impl Into<String>, key: impl Into<String>, value: Bytes) -> Self {
        let now = Timestamp::now();
        Self {
            row_type: row_type.into(),
            key: key.into(),
            value,
            operation_lsn: Lsn::ZERO,
            last_modified_utc: now,
            last_modified_on_primary_utc: now,
        }
    }

    pub fn row_key(&self) -> RowKey {
        RowKey::new(self.row_type.clone(), self.key.clone())
    }

    pub fn value_len(&self) -> usize {
        self.value.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_key_orders_by_type_then_key() {
        let a = RowKey::new("A", "z");
        let b = RowKey::new("B", "a");
        let c = RowKey::new("B", "b");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn row_roundtrips_through_postcard() {
        let row = Row::new("T", "k1", Bytes::from_static(b"\xde\xad\xbe\xef"));
        let bytes = postcard::to_allocvec(&row).unwrap();
        let back: Row = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(row, back);
    }
}
