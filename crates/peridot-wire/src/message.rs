//! Messages between the failover manager and the reconfiguration agent.
//!
//! Every message is a [`Message`] envelope: the sender's node instance, an
//! activity id for correlation, the generation header (absent only on
//! node-local traffic) and a typed body. The action is derived from the
//! body, so an envelope can never carry a mismatched action string.

use peridot_types::{
    ActivityId, ConsistencyUnitId, Epoch, FailoverManagerKind, FailoverUnitId, GenerationHeader,
    GenerationNumber, Lsn, NodeInstance, ReplicaDescription, ServiceDescription,
};
use serde::{Deserialize, Serialize};

// ============================================================================
// Shared description fragments
// ============================================================================

/// Identity and epoch pair of one failover unit as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverUnitDescription {
    pub ft_id: FailoverUnitId,
    pub consistency_unit_id: ConsistencyUnitId,
    pub current_epoch: Epoch,

    /// Invalid unless a reconfiguration is in progress.
    pub previous_epoch: Epoch,
}

impl FailoverUnitDescription {
    pub fn new(ft_id: FailoverUnitId, consistency_unit_id: ConsistencyUnitId, epoch: Epoch) -> Self {
        Self {
            ft_id,
            consistency_unit_id,
            current_epoch: epoch,
            previous_epoch: Epoch::INVALID,
        }
    }

    pub fn is_reconfiguring(&self) -> bool {
        !self.previous_epoch.is_invalid()
    }
}

/// One failover unit plus its local replica, as reported to the FM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverUnitInfo {
    pub failover_unit: FailoverUnitDescription,
    pub replica: ReplicaDescription,
}

/// Success/failure outcome carried on reply messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OperationOutcome {
    #[default]
    Success,
    Failed {
        reason: String,
    },
}

impl OperationOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        OperationOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Success)
    }
}

// ============================================================================
// Message bodies
// ============================================================================

/// Body for configuration-changing messages: the full replica set view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationBody {
    pub failover_unit: FailoverUnitDescription,
    pub service: Option<ServiceDescription>,
    pub replicas: Vec<ReplicaDescription>,

    /// Idempotence gate: retransmissions reuse the sequence number.
    pub sequence_number: i64,
}

/// Body addressing a single replica of a failover unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMessageBody {
    pub failover_unit: FailoverUnitDescription,
    pub replica: ReplicaDescription,
    pub service: Option<ServiceDescription>,
}

/// Reply carrying the (possibly updated) replica description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaReplyBody {
    pub failover_unit: FailoverUnitDescription,
    pub replica: ReplicaDescription,
    pub outcome: OperationOutcome,
}

/// Bulk replica report (`ReplicaUp`, `LfumUpload`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaListBody {
    pub up: Vec<FailoverUnitInfo>,
    pub dropped: Vec<FailoverUnitInfo>,

    /// Set on the final `ReplicaUp` batch after node up.
    pub is_last: bool,
}

/// Node presence announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpBody {
    pub node: NodeInstance,
    pub node_version: String,
}

/// Node activation / deactivation order from an FM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeActivationBody {
    pub kind: FailoverManagerKind,

    /// Monotonic per-FM sequence number; stale orders are dropped.
    pub sequence_number: i64,

    pub activate: bool,
}

/// Generation proposal / update flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationBody {
    pub generation: GenerationHeader,

    /// For proposal replies: the generation the node currently holds.
    pub current: Option<GenerationNumber>,
}

/// Fault report escalated to the FM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFaultBody {
    pub failover_unit: FailoverUnitDescription,
    pub replica: ReplicaDescription,
    pub is_permanent: bool,
}

/// Service type enable/disable notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTypeBody {
    pub service_type: String,
}

/// LSN report used during Phase1 of a reconfiguration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLsnReplyBody {
    pub failover_unit: FailoverUnitDescription,
    pub replica: ReplicaDescription,
    pub last_acked_lsn: Option<Lsn>,
    pub outcome: OperationOutcome,
}

/// The typed body of a failover message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    // ========================================================================
    // Reconfiguration protocol
    // ========================================================================
    DoReconfiguration(ConfigurationBody),
    DoReconfigurationReply(ReplicaReplyBody),
    ChangeConfiguration(ConfigurationBody),
    Deactivate(ConfigurationBody),
    DeactivateReply(ReplicaReplyBody),
    Activate(ConfigurationBody),
    ActivateReply(ReplicaReplyBody),
    GetLsn(ReplicaMessageBody),
    GetLsnReply(GetLsnReplyBody),

    // ========================================================================
    // Replica lifecycle
    // ========================================================================
    ReplicaOpen(ReplicaMessageBody),
    ReplicaOpenReply(ReplicaReplyBody),
    ReplicaClose(ReplicaMessageBody),
    ReplicaCloseReply(ReplicaReplyBody),
    ReplicaUp(ReplicaListBody),
    ReplicaUpReply(ReplicaListBody),
    ReplicaDropped(ReplicaMessageBody),
    ReplicaDroppedReply(ReplicaReplyBody),
    ReplicaEndpointUpdated(ReplicaMessageBody),
    ReplicaEndpointUpdatedReply(ReplicaReplyBody),

    // ========================================================================
    // Node lifecycle
    // ========================================================================
    NodeUp(NodeUpBody),
    NodeUpAck(NodeActivationBody),
    NodeActivate(NodeActivationBody),
    NodeDeactivate(NodeActivationBody),

    // ========================================================================
    // Generation management
    // ========================================================================
    GenerationUpdate(GenerationBody),
    GenerationProposal(GenerationBody),
    GenerationProposalReply(GenerationBody),

    // ========================================================================
    // Misc
    // ========================================================================
    LfumUpload(ReplicaListBody),
    ReportFault(ReportFaultBody),
    ServiceTypeEnabled(ServiceTypeBody),
    ServiceTypeDisabled(ServiceTypeBody),
}

/// The action discriminant of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageAction {
    DoReconfiguration,
    DoReconfigurationReply,
    ChangeConfiguration,
    Deactivate,
    DeactivateReply,
    Activate,
    ActivateReply,
    GetLsn,
    GetLsnReply,
    ReplicaOpen,
    ReplicaOpenReply,
    ReplicaClose,
    ReplicaCloseReply,
    ReplicaUp,
    ReplicaUpReply,
    ReplicaDropped,
    ReplicaDroppedReply,
    ReplicaEndpointUpdated,
    ReplicaEndpointUpdatedReply,
    NodeUp,
    NodeUpAck,
    NodeActivate,
    NodeDeactivate,
    GenerationUpdate,
    GenerationProposal,
    GenerationProposalReply,
    LfumUpload,
    ReportFault,
    ServiceTypeEnabled,
    ServiceTypeDisabled,
}

impl MessageBody {
    /// The action this body represents.
    pub fn action(&self) -> MessageAction {
        match self {
            MessageBody::DoReconfiguration(_) => MessageAction::DoReconfiguration,
            MessageBody::DoReconfigurationReply(_) => MessageAction::DoReconfigurationReply,
            MessageBody::ChangeConfiguration(_) => MessageAction::ChangeConfiguration,
            MessageBody::Deactivate(_) => MessageAction::Deactivate,
            MessageBody::DeactivateReply(_) => MessageAction::DeactivateReply,
            MessageBody::Activate(_) => MessageAction::Activate,
            MessageBody::ActivateReply(_) => MessageAction::ActivateReply,
            MessageBody::GetLsn(_) => MessageAction::GetLsn,
            MessageBody::GetLsnReply(_) => MessageAction::GetLsnReply,
            MessageBody::ReplicaOpen(_) => MessageAction::ReplicaOpen,
            MessageBody::ReplicaOpenReply(_) => MessageAction::ReplicaOpenReply,
            MessageBody::ReplicaClose(_) => MessageAction::ReplicaClose,
            MessageBody::ReplicaCloseReply(_) => MessageAction::ReplicaCloseReply,
            MessageBody::ReplicaUp(_) => MessageAction::ReplicaUp,
            MessageBody::ReplicaUpReply(_) => MessageAction::ReplicaUpReply,
            MessageBody::ReplicaDropped(_) => MessageAction::ReplicaDropped,
            MessageBody::ReplicaDroppedReply(_) => MessageAction::ReplicaDroppedReply,
            MessageBody::ReplicaEndpointUpdated(_) => MessageAction::ReplicaEndpointUpdated,
            MessageBody::ReplicaEndpointUpdatedReply(_) => {
                MessageAction::ReplicaEndpointUpdatedReply
            }
            MessageBody::NodeUp(_) => MessageAction::NodeUp,
            MessageBody::NodeUpAck(_) => MessageAction::NodeUpAck,
            MessageBody::NodeActivate(_) => MessageAction::NodeActivate,
            MessageBody::NodeDeactivate(_) => MessageAction::NodeDeactivate,
            MessageBody::GenerationUpdate(_) => MessageAction::GenerationUpdate,
            MessageBody::GenerationProposal(_) => MessageAction::GenerationProposal,
            MessageBody::GenerationProposalReply(_) => MessageAction::GenerationProposalReply,
            MessageBody::LfumUpload(_) => MessageAction::LfumUpload,
            MessageBody::ReportFault(_) => MessageAction::ReportFault,
            MessageBody::ServiceTypeEnabled(_) => MessageAction::ServiceTypeEnabled,
            MessageBody::ServiceTypeDisabled(_) => MessageAction::ServiceTypeDisabled,
        }
    }

    /// The failover unit this body targets, if it targets one.
    pub fn failover_unit(&self) -> Option<FailoverUnitDescription> {
        match self {
            MessageBody::DoReconfiguration(b)
            | MessageBody::ChangeConfiguration(b)
            | MessageBody::Deactivate(b)
            | MessageBody::Activate(b) => Some(b.failover_unit),
            MessageBody::DoReconfigurationReply(b)
            | MessageBody::DeactivateReply(b)
            | MessageBody::ActivateReply(b)
            | MessageBody::ReplicaOpenReply(b)
            | MessageBody::ReplicaCloseReply(b)
            | MessageBody::ReplicaDroppedReply(b)
            | MessageBody::ReplicaEndpointUpdatedReply(b) => Some(b.failover_unit),
            MessageBody::GetLsn(b)
            | MessageBody::ReplicaOpen(b)
            | MessageBody::ReplicaClose(b)
            | MessageBody::ReplicaDropped(b)
            | MessageBody::ReplicaEndpointUpdated(b) => Some(b.failover_unit),
            MessageBody::GetLsnReply(b) => Some(b.failover_unit),
            MessageBody::ReportFault(b) => Some(b.failover_unit),
            _ => None,
        }
    }
}

// ============================================================================
// Message Envelope
// ============================================================================

/// A failover protocol message with routing information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The node instance that sent this message.
    pub from: NodeInstance,

    /// Per-operation correlation id.
    pub activity_id: ActivityId,

    /// Generation header; present on all FM ↔ RA traffic.
    pub generation: Option<GenerationHeader>,

    pub body: MessageBody,
}

impl Message {
    pub fn new(from: NodeInstance, activity_id: ActivityId, body: MessageBody) -> Self {
        Self {
            from,
            activity_id,
            generation: None,
            body,
        }
    }

    pub fn with_generation(mut self, generation: GenerationHeader) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn action(&self) -> MessageAction {
        self.body.action()
    }

    /// Canonical byte encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peridot_types::{InstanceId, NodeId, ReplicaId};

    fn fu_desc() -> FailoverUnitDescription {
        FailoverUnitDescription::new(
            FailoverUnitId::generate(),
            ConsistencyUnitId::generate(),
            Epoch::new(1, 3),
        )
    }

    fn replica() -> ReplicaDescription {
        ReplicaDescription::new(
            NodeInstance::new(NodeId::new(1), 1),
            ReplicaId::new(10),
            InstanceId::new(1),
        )
    }

    #[test]
    fn action_is_derived_from_body() {
        let msg = Message::new(
            NodeInstance::new(NodeId::new(1), 1),
            ActivityId::generate(),
            MessageBody::GetLsn(ReplicaMessageBody {
                failover_unit: fu_desc(),
                replica: replica(),
                service: None,
            }),
        );
        assert_eq!(msg.action(), MessageAction::GetLsn);
        assert!(msg.body.failover_unit().is_some());
    }

    #[test]
    fn envelope_roundtrips_through_postcard() {
        let msg = Message::new(
            NodeInstance::new(NodeId::new(7), 3),
            ActivityId::generate(),
            MessageBody::DoReconfiguration(ConfigurationBody {
                failover_unit: fu_desc(),
                service: None,
                replicas: vec![replica()],
                sequence_number: 42,
            }),
        )
        .with_generation(GenerationHeader::new(
            GenerationNumber::new(5),
            FailoverManagerKind::Fm,
        ));

        let bytes = msg.to_bytes().unwrap();
        let back = Message::from_bytes(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn node_level_bodies_have_no_failover_unit() {
        let body = MessageBody::NodeActivate(NodeActivationBody {
            kind: FailoverManagerKind::Fm,
            sequence_number: 1,
            activate: true,
        });
        assert!(body.failover_unit().is_none());
    }
}
