//! State-machine actions.
//!
//! Job items never perform I/O while holding the entity lock: they queue
//! actions, and the agent dispatches the queue after the lock releases
//! (and only if the cycle's commit succeeded).

use std::time::Duration;

use peridot_types::{FailoverManagerKind, FailoverUnitId, NodeInstance};
use peridot_wire::{MessageBody, ProxyRequest};

use crate::health::HealthReport;

/// An action queued by a job item during an execution cycle.
#[derive(Debug)]
pub enum StateMachineAction {
    /// Send a message to a failover manager.
    SendToFm {
        kind: FailoverManagerKind,
        body: MessageBody,
    },

    /// Send a message to the reconfiguration agent on another node.
    SendToNode { node: NodeInstance, body: MessageBody },

    /// Send an IPC request to the failover unit proxy.
    SendToProxy(ProxyRequest),

    /// Arm the failover unit's retry timer.
    ArmRetry {
        ft_id: FailoverUnitId,
        delay: Duration,
    },

    /// Emit a health report.
    ReportHealth(HealthReport),

    /// Request termination of the hosting process.
    TerminateHost {
        runtime_id: String,
        reason: String,
    },
}
