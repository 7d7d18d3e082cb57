//! Per-action routing metadata.
//!
//! The reconfiguration agent's dispatcher consults this table before any
//! other processing: who the message is for, whether it may create a
//! failover unit record, whether it is processed while the node is closing,
//! and which staleness check applies.

use serde::{Deserialize, Serialize};

use crate::message::MessageAction;

/// Who a message is intended for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageTarget {
    /// The node-level agent singleton.
    Ra,

    /// A specific failover unit.
    FailoverUnit,
}

/// Which staleness check the dispatcher applies before processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StalenessCheck {
    None,

    /// Epoch + replica instance checks for failover messages from the FM.
    FtFailover,

    /// Epoch + replica instance checks for proxy replies.
    FtProxy,
}

/// Routing metadata of one message action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMetadata {
    pub target: MessageTarget,
    pub creates_entity: bool,
    pub process_during_node_close: bool,
    pub staleness_check: StalenessCheck,
}

const RA_NORMAL: MessageMetadata = MessageMetadata {
    target: MessageTarget::Ra,
    creates_entity: false,
    process_during_node_close: false,
    staleness_check: StalenessCheck::None,
};

const RA_PROCESS_DURING_NODE_CLOSE: MessageMetadata = MessageMetadata {
    target: MessageTarget::Ra,
    creates_entity: false,
    process_during_node_close: true,
    staleness_check: StalenessCheck::None,
};

const FT_FAILOVER_NORMAL: MessageMetadata = MessageMetadata {
    target: MessageTarget::FailoverUnit,
    creates_entity: false,
    process_during_node_close: false,
    staleness_check: StalenessCheck::FtFailover,
};

const FT_FAILOVER_CREATES_ENTITY: MessageMetadata = MessageMetadata {
    target: MessageTarget::FailoverUnit,
    creates_entity: true,
    process_during_node_close: false,
    staleness_check: StalenessCheck::FtFailover,
};

const FT_FAILOVER_PROCESS_DURING_NODE_CLOSE: MessageMetadata = MessageMetadata {
    target: MessageTarget::FailoverUnit,
    creates_entity: false,
    process_during_node_close: true,
    staleness_check: StalenessCheck::FtFailover,
};

/// Looks up the routing metadata for an action.
pub fn metadata_for(action: MessageAction) -> MessageMetadata {
    use MessageAction as A;
    match action {
        // Reconfiguration traffic addresses existing failover units; the
        // messages that introduce a replica to a node may create the record.
        A::DoReconfiguration | A::ChangeConfiguration => FT_FAILOVER_CREATES_ENTITY,
        A::Deactivate | A::Activate | A::GetLsn => FT_FAILOVER_NORMAL,
        A::ReplicaOpen => FT_FAILOVER_CREATES_ENTITY,

        // Close-path traffic must flow while the node shuts down.
        A::ReplicaClose | A::ReplicaDroppedReply => FT_FAILOVER_PROCESS_DURING_NODE_CLOSE,

        // Replies from remote agents and the FM.
        A::DoReconfigurationReply
        | A::DeactivateReply
        | A::ActivateReply
        | A::GetLsnReply
        | A::ReplicaOpenReply
        | A::ReplicaCloseReply
        | A::ReplicaEndpointUpdated
        | A::ReplicaEndpointUpdatedReply
        | A::ReplicaDropped
        | A::ReportFault => FT_FAILOVER_NORMAL,

        // Node-level traffic.
        A::ReplicaUp
        | A::ReplicaUpReply
        | A::NodeUp
        | A::NodeUpAck
        | A::GenerationUpdate
        | A::GenerationProposal
        | A::GenerationProposalReply
        | A::LfumUpload
        | A::ServiceTypeEnabled
        | A::ServiceTypeDisabled => RA_NORMAL,

        // Activation state changes apply even while closing.
        A::NodeActivate | A::NodeDeactivate => RA_PROCESS_DURING_NODE_CLOSE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(MessageAction::DoReconfiguration, MessageTarget::FailoverUnit, true; "do reconfiguration creates")]
    #[test_case(MessageAction::ReplicaOpen, MessageTarget::FailoverUnit, true; "replica open creates")]
    #[test_case(MessageAction::GetLsn, MessageTarget::FailoverUnit, false; "get lsn does not create")]
    #[test_case(MessageAction::NodeUp, MessageTarget::Ra, false; "node up targets ra")]
    fn metadata_table(action: MessageAction, target: MessageTarget, creates: bool) {
        let meta = metadata_for(action);
        assert_eq!(meta.target, target);
        assert_eq!(meta.creates_entity, creates);
    }

    #[test]
    fn close_path_processes_during_node_close() {
        assert!(metadata_for(MessageAction::ReplicaClose).process_during_node_close);
        assert!(metadata_for(MessageAction::NodeDeactivate).process_during_node_close);
        assert!(!metadata_for(MessageAction::DoReconfiguration).process_during_node_close);
    }

    #[test]
    fn ft_messages_carry_failover_staleness_check() {
        assert_eq!(
            metadata_for(MessageAction::Activate).staleness_check,
            StalenessCheck::FtFailover
        );
        assert_eq!(
            metadata_for(MessageAction::NodeUp).staleness_check,
            StalenessCheck::None
        );
    }
}
