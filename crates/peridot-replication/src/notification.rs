//! Change notifications to store subscribers.
//!
//! Subscribers observe committed changes in LSN order. On secondaries the
//! notification mode decides how dispatch interacts with replication
//! acknowledgement:
//!
//! - `None`: no secondary notifications
//! - `NonBlockingQuorumAcked`: dispatch after the operation is acknowledged;
//!   the ack never waits on the subscriber
//! - `BlockSecondaryAck`: the ack to the primary is withheld until the local
//!   subscriber has consumed the operation, buying read-your-writes on
//!   standby reads at the cost of write latency

use bytes::Bytes;
use peridot_types::Lsn;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// The kind of a single row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row mutation inside a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChange {
    pub kind: ChangeKind,
    pub row_type: String,
    pub key: String,

    /// Empty for deletes.
    pub value: Bytes,
}

impl RowChange {
    pub fn size_bytes(&self) -> u64 {
        (self.row_type.len() + self.key.len() + self.value.len()) as u64
    }
}

/// A notification dispatched to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeNotification {
    /// A transaction committed at `lsn` with these changes.
    Commit { lsn: Lsn, changes: Vec<RowChange> },

    /// The replica suffered data loss and was logically reset.
    DataLoss,
}

/// When secondary subscribers observe replicated operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SecondaryNotificationMode {
    None,

    #[default]
    NonBlockingQuorumAcked,

    BlockSecondaryAck,
}

/// A subscriber to store change notifications.
///
/// Dispatch is strictly LSN-ordered. Under `BlockSecondaryAck` the return
/// from [`StoreSubscriber::on_notification`] releases the replication ack.
pub trait StoreSubscriber: Send + Sync {
    fn on_notification(&self, notification: &ChangeNotification);
}

/// Subscriber registry with ordered dispatch.
#[derive(Default)]
pub(crate) struct NotificationDispatcher {
    subscribers: Mutex<Vec<Arc<dyn StoreSubscriber>>>,

    /// Highest LSN dispatched; enforces LSN-ordered delivery.
    last_dispatched: Mutex<Lsn>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn StoreSubscriber>) {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(subscriber);
    }

    pub fn dispatch_commit(&self, lsn: Lsn, changes: Vec<RowChange>) {
        let mut last = self
            .last_dispatched
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        debug_assert!(lsn > *last, "commit notifications must be LSN ordered");
        *last = lsn;

        let notification = ChangeNotification::Commit { lsn, changes };
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        drop(last);

        for subscriber in subscribers {
            subscriber.on_notification(&notification);
        }
    }

    /// Dispatches copied rows to subscribers (copy-notification prefetch).
    ///
    /// Copy streams replay history, so the ordering gate is advanced rather
    /// than asserted.
    pub fn dispatch_copy_prefetch(&self, lsn: Lsn, changes: Vec<RowChange>) {
        {
            let mut last = self
                .last_dispatched
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *last = (*last).max(lsn);
        }

        let notification = ChangeNotification::Commit { lsn, changes };
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        for subscriber in subscribers {
            subscriber.on_notification(&notification);
        }
    }

    pub fn dispatch_data_loss(&self) {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        for subscriber in subscribers {
            subscriber.on_notification(&ChangeNotification::DataLoss);
        }
    }

    /// Resets the ordering gate (restore and rebuild reset the LSN space).
    pub fn reset_ordering(&self, lsn: Lsn) {
        *self
            .last_dispatched
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = lsn;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        lsns: Mutex<Vec<i64>>,
    }

    impl StoreSubscriber for Recorder {
        fn on_notification(&self, notification: &ChangeNotification) {
            if let ChangeNotification::Commit { lsn, .. } = notification {
                self.lsns
                    .lock()
                    .unwrap()
                    .push(lsn.as_i64());
            }
        }
    }

    #[test]
    fn dispatch_is_lsn_ordered() {
        let dispatcher = NotificationDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.subscribe(recorder.clone());

        dispatcher.dispatch_commit(Lsn::new(1), vec![]);
        dispatcher.dispatch_commit(Lsn::new(2), vec![]);
        dispatcher.dispatch_commit(Lsn::new(3), vec![]);

        assert_eq!(*recorder.lsns.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn reset_allows_restarting_the_sequence() {
        let dispatcher = NotificationDispatcher::new();
        dispatcher.dispatch_commit(Lsn::new(5), vec![]);
        dispatcher.reset_ordering(Lsn::ZERO);
        dispatcher.dispatch_commit(Lsn::new(1), vec![]);
    }
}
