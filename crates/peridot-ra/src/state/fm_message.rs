//! Pending FM message stage of a failover unit.

use serde::{Deserialize, Serialize};

/// Which message (if any) this failover unit owes the failover manager.
///
/// At most one FM message is pending per unit; the retry machinery resends
/// it until the matching reply clears the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FmMessageStage {
    #[default]
    None,
    ReplicaDown,
    ReplicaUp,
    ReplicaDropped,
    EndpointAvailable,
    ReplicaUpload,
}

impl std::fmt::Display for FmMessageStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FmMessageStage::None => "None",
            FmMessageStage::ReplicaDown => "ReplicaDown",
            FmMessageStage::ReplicaUp => "ReplicaUp",
            FmMessageStage::ReplicaDropped => "ReplicaDropped",
            FmMessageStage::EndpointAvailable => "EndpointAvailable",
            FmMessageStage::ReplicaUpload => "ReplicaUpload",
        };
        write!(f, "{s}")
    }
}
