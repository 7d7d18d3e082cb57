//! The durable record for one partition replica on a node.

use peridot_store::api::RowType;
use peridot_types::{
    ConsistencyUnitId, Epoch, FailoverUnitId, NodeId, ReplicaDescription, ReplicaId,
    ReplicaLifecycle, ServiceDescription,
};
use serde::{Deserialize, Serialize};

use crate::actions::StateMachineAction;
use crate::infrastructure::EntityState;
use crate::RaError;

use super::fm_message::FmMessageStage;
use super::reconfiguration::ReconfigurationState;
use super::retryable_error::RetryableErrorState;

/// Schema version of the persisted form. The version leads the payload so
/// rolling engine changes can evolve the layout without a drop/rebuild.
pub const FT_STATE_VERSION: u8 = 1;

/// Node deactivation info mirrored into each failover unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivationInfo {
    pub sequence_number: i64,
    pub is_activated: bool,
}

impl Default for DeactivationInfo {
    fn default() -> Self {
        Self {
            sequence_number: 0,
            is_activated: true,
        }
    }
}

/// One failover unit: the partition's failover state record held by the
/// agent.
///
/// # Invariants
///
/// - at most one local replica (structural: `local_replica` is an option)
/// - `previous_epoch` is invalid unless a reconfiguration is in progress
/// - a primary's `current_epoch` is never behind a configuration member's
/// - `last_acked_lsn` never regresses within an epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverUnit {
    pub ft_id: FailoverUnitId,
    pub consistency_unit_id: ConsistencyUnitId,
    pub current_epoch: Epoch,
    pub previous_epoch: Epoch,
    pub service: ServiceDescription,
    pub local_replica: Option<ReplicaDescription>,
    pub remote_replicas: Vec<ReplicaDescription>,
    pub deactivation: DeactivationInfo,
    pub fm_message_stage: FmMessageStage,

    /// Idempotence gate: the highest reconfiguration sequence number
    /// processed. Redelivery of the same message cannot change state.
    pub message_sequence_number: i64,

    pub reconfiguration: ReconfigurationState,

    /// Consecutive failures of the current replica operation.
    pub retryable_error: RetryableErrorState,

    /// Whether this unit still owes the FM its `ReplicaUp` after node up.
    pub upload_pending: bool,

    pub down_replicas: Vec<ReplicaId>,

    /// Terminal: set once the FM acknowledged `ReplicaDropped`; the record
    /// is erased at the next commit.
    pub deleted: bool,
}

impl FailoverUnit {
    pub fn new(
        ft_id: FailoverUnitId,
        consistency_unit_id: ConsistencyUnitId,
        epoch: Epoch,
        service: ServiceDescription,
    ) -> Self {
        Self {
            ft_id,
            consistency_unit_id,
            current_epoch: epoch,
            previous_epoch: Epoch::INVALID,
            service,
            local_replica: None,
            remote_replicas: Vec::new(),
            deactivation: DeactivationInfo::default(),
            fm_message_stage: FmMessageStage::None,
            message_sequence_number: 0,
            reconfiguration: ReconfigurationState::default(),
            retryable_error: RetryableErrorState::new(),
            upload_pending: false,
            down_replicas: Vec::new(),
            deleted: false,
        }
    }

    pub fn is_reconfiguring(&self) -> bool {
        !self.previous_epoch.is_invalid()
    }

    /// The wire description of this unit.
    pub fn description(&self) -> peridot_wire::FailoverUnitDescription {
        peridot_wire::FailoverUnitDescription {
            ft_id: self.ft_id,
            consistency_unit_id: self.consistency_unit_id,
            current_epoch: self.current_epoch,
            previous_epoch: self.previous_epoch,
        }
    }

    /// Local and remote replicas, local first.
    pub fn all_replicas(&self) -> Vec<ReplicaDescription> {
        let mut replicas = Vec::with_capacity(1 + self.remote_replicas.len());
        if let Some(local) = &self.local_replica {
            replicas.push(local.clone());
        }
        replicas.extend(self.remote_replicas.iter().cloned());
        replicas
    }

    /// Replaces the replica set from an FM configuration message, keeping
    /// the replica on `local_node` as the local replica.
    pub fn install_replica_set(&mut self, local_node: NodeId, replicas: Vec<ReplicaDescription>) {
        self.local_replica = None;
        self.remote_replicas.clear();
        for replica in replicas {
            if replica.node.id == local_node {
                self.local_replica = Some(replica);
            } else {
                self.remote_replicas.push(replica);
            }
        }
    }

    pub fn replica(&self, id: ReplicaId) -> Option<&ReplicaDescription> {
        if let Some(local) = &self.local_replica {
            if local.replica_id == id {
                return Some(local);
            }
        }
        self.remote_replicas.iter().find(|r| r.replica_id == id)
    }

    pub fn replica_mut(&mut self, id: ReplicaId) -> Option<&mut ReplicaDescription> {
        if let Some(local) = &mut self.local_replica {
            if local.replica_id == id {
                return Some(local);
            }
        }
        self.remote_replicas.iter_mut().find(|r| r.replica_id == id)
    }

    /// Remote replicas in the current configuration.
    pub fn current_configuration_remotes(&self) -> Vec<&ReplicaDescription> {
        self.remote_replicas
            .iter()
            .filter(|r| r.is_in_current_configuration())
            .collect()
    }

    /// Remote replicas in the previous configuration.
    pub fn previous_configuration_remotes(&self) -> Vec<&ReplicaDescription> {
        self.remote_replicas
            .iter()
            .filter(|r| r.is_in_previous_configuration())
            .collect()
    }

    /// Read quorum of the current configuration (including local).
    pub fn read_quorum_size(&self) -> usize {
        let members = 1 + self.current_configuration_remotes().len();
        members / 2 + 1
    }

    /// Records a node-down observation for a remote replica.
    pub fn mark_replica_down(&mut self, id: ReplicaId) {
        if let Some(replica) = self.replica_mut(id) {
            replica.state = ReplicaLifecycle::Down;
        }
        if !self.down_replicas.contains(&id) {
            self.down_replicas.push(id);
        }
    }

    /// Serializes into the versioned persisted form.
    pub fn to_persisted_bytes(&self) -> Result<Vec<u8>, RaError> {
        let mut bytes = vec![FT_STATE_VERSION];
        bytes.extend(postcard::to_allocvec(self)?);
        Ok(bytes)
    }

    /// Parses the versioned persisted form.
    pub fn from_persisted_bytes(bytes: &[u8]) -> Result<Self, RaError> {
        let Some((&version, payload)) = bytes.split_first() else {
            return Err(RaError::UnsupportedSchemaVersion(0));
        };
        if version != FT_STATE_VERSION {
            return Err(RaError::UnsupportedSchemaVersion(version));
        }
        Ok(postcard::from_bytes(payload)?)
    }
}

impl EntityState for FailoverUnit {
    type Id = FailoverUnitId;
    type Action = StateMachineAction;

    fn id(&self) -> FailoverUnitId {
        self.ft_id
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn is_open(&self) -> bool {
        !self.deleted
            && self
                .local_replica
                .as_ref()
                .is_some_and(|r| r.state != ReplicaLifecycle::Dropped)
    }

    fn row_type() -> RowType {
        RowType::FailoverUnit
    }

    fn persistence_id(&self) -> String {
        self.ft_id.to_string()
    }

    fn serialize(&self) -> Result<Vec<u8>, String> {
        self.to_persisted_bytes().map_err(|e| e.to_string())
    }
}
