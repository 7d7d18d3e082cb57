//! The replica and replicator interfaces the proxy drives.
//!
//! These are the in-host seams: the stateful service replica (user code)
//! and the replicator engine. The proxy orders their lifecycle; recording
//! fakes capture the call sequence for tests.

use std::sync::Mutex;

use peridot_types::{Epoch, Lsn, ReplicaDescription, ReplicaId, ReplicaRole};
use peridot_wire::ReplicatorQueryResult;

/// Catch-up levels the proxy can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupMode {
    /// Catch up until a write quorum reaches the target progress.
    Quorum,

    /// Catch up every replica in the set.
    All,
}

/// The stateful service replica hosted in this process.
pub trait StatefulServiceReplica: Send + Sync {
    fn open(&self, role: ReplicaRole, epoch: Epoch) -> Result<(), String>;

    fn change_role(&self, role: ReplicaRole) -> Result<(), String>;

    /// Graceful close; drains in-flight work.
    fn close(&self) -> Result<(), String>;

    /// Synchronous teardown; drops all resources even if a close stalled.
    fn abort(&self);
}

/// The replicator engine for this replica.
pub trait ReplicatorClient: Send + Sync {
    fn open(&self) -> Result<(), String>;

    fn change_role(&self, role: ReplicaRole, epoch: Epoch) -> Result<(), String>;

    fn update_epoch(&self, epoch: Epoch) -> Result<(), String>;

    fn catchup(&self, mode: CatchupMode) -> Result<(), String>;

    fn cancel_catchup(&self);

    fn build_idle_replica(&self, replica: &ReplicaDescription) -> Result<(), String>;

    fn remove_idle_replica(&self, replica_id: ReplicaId) -> Result<(), String>;

    /// Installs the current/previous configuration in the replicator.
    fn update_configuration(
        &self,
        current: &[ReplicaDescription],
        previous: &[ReplicaDescription],
    ) -> Result<(), String>;

    fn get_status(&self) -> ReplicatorQueryResult;

    fn close(&self) -> Result<(), String>;

    fn abort(&self);
}

// ============================================================================
// Recording fakes
// ============================================================================

/// Replica fake that records calls and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingReplica {
    calls: Mutex<Vec<String>>,
    fail_next: Mutex<Option<String>>,
}

impl RecordingReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn fail_next_call(&self, reason: impl Into<String>) {
        *self
            .fail_next
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(reason.into());
    }

    fn record(&self, call: String) -> Result<(), String> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(call);
        match self
            .fail_next
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }
}

impl StatefulServiceReplica for RecordingReplica {
    fn open(&self, role: ReplicaRole, epoch: Epoch) -> Result<(), String> {
        self.record(format!("open:{role}:{epoch}"))
    }

    fn change_role(&self, role: ReplicaRole) -> Result<(), String> {
        self.record(format!("change_role:{role}"))
    }

    fn close(&self) -> Result<(), String> {
        self.record("close".to_string())
    }

    fn abort(&self) {
        let _ = self.record("abort".to_string());
    }
}

/// Replicator fake that records calls and reports a configurable status.
#[derive(Debug)]
pub struct RecordingReplicator {
    calls: Mutex<Vec<String>>,
    fail_next: Mutex<Option<String>>,
    status: Mutex<ReplicatorQueryResult>,
}

impl RecordingReplicator {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
            status: Mutex::new(ReplicatorQueryResult {
                role: ReplicaRole::Unknown,
                current_epoch: Epoch::INVALID,
                last_acked_lsn: Some(Lsn::ZERO),
                first_lsn: Some(Lsn::ZERO),
                replication_queue_depth: 0,
            }),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn fail_next_call(&self, reason: impl Into<String>) {
        *self
            .fail_next
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(reason.into());
    }

    pub fn set_status(&self, status: ReplicatorQueryResult) {
        *self
            .status
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = status;
    }

    fn record(&self, call: String) -> Result<(), String> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(call);
        match self
            .fail_next
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }
}

impl Default for RecordingReplicator {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatorClient for RecordingReplicator {
    fn open(&self) -> Result<(), String> {
        self.record("open".to_string())
    }

    fn change_role(&self, role: ReplicaRole, epoch: Epoch) -> Result<(), String> {
        self.record(format!("change_role:{role}:{epoch}"))
    }

    fn update_epoch(&self, epoch: Epoch) -> Result<(), String> {
        self.record(format!("update_epoch:{epoch}"))
    }

    fn catchup(&self, mode: CatchupMode) -> Result<(), String> {
        self.record(format!("catchup:{mode:?}"))
    }

    fn cancel_catchup(&self) {
        let _ = self.record("cancel_catchup".to_string());
    }

    fn build_idle_replica(&self, replica: &ReplicaDescription) -> Result<(), String> {
        self.record(format!("build_idle:{}", replica.replica_id))
    }

    fn remove_idle_replica(&self, replica_id: ReplicaId) -> Result<(), String> {
        self.record(format!("remove_idle:{replica_id}"))
    }

    fn update_configuration(
        &self,
        current: &[ReplicaDescription],
        previous: &[ReplicaDescription],
    ) -> Result<(), String> {
        self.record(format!(
            "update_configuration:cc={}:pc={}",
            current.len(),
            previous.len()
        ))
    }

    fn get_status(&self) -> ReplicatorQueryResult {
        let _ = self.record("get_status".to_string());
        *self
            .status
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn close(&self) -> Result<(), String> {
        self.record("close".to_string())
    }

    fn abort(&self) {
        let _ = self.record("abort".to_string());
    }
}
