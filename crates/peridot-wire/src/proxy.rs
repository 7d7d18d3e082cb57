//! IPC bodies between the reconfiguration agent and the failover unit proxy.
//!
//! The agent and the proxy live in different processes (node vs. service
//! host) and talk request/reply over a node-local IPC channel. A request
//! carries the action, the failover unit and replica descriptions the proxy
//! should act on, and optional remote replicas and service description; the
//! reply echoes the descriptions back with the outcome and, for queries,
//! the replicator status.

use peridot_types::{Epoch, Lsn, ReplicaDescription, ReplicaRole, ServiceDescription};
use serde::{Deserialize, Serialize};

use crate::message::{FailoverUnitDescription, OperationOutcome};

/// Actions the agent can order the proxy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyAction {
    ReplicaOpen,
    ReplicaClose,
    StatefulServiceReopen,
    UpdateConfiguration,
    ReplicatorBuildIdleReplica,
    ReplicatorRemoveIdleReplica,
    ReplicatorGetStatus,
    ReplicatorUpdateEpochAndGetStatus,
    CancelCatchupReplicaSet,
    ReplicaEndpointUpdatedReply,
    ReadWriteStatusRevokedNotificationReply,
    UpdateServiceDescription,
    Query,
}

/// Request flags modifying how the proxy runs an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProxyMessageFlags {
    /// Close should abort instead of draining.
    pub abort: bool,

    /// Close is part of a drop; durable state is discarded.
    pub drop_replica: bool,

    /// `UpdateConfiguration` should also catch the replica set up.
    pub catchup: bool,

    /// Catch-up must reach the full progress of the replica set, not just
    /// the write quorum.
    pub catchup_all: bool,
}

impl ProxyMessageFlags {
    pub const NONE: ProxyMessageFlags = ProxyMessageFlags {
        abort: false,
        drop_replica: false,
        catchup: false,
        catchup_all: false,
    };

    pub const CATCHUP_QUORUM: ProxyMessageFlags = ProxyMessageFlags {
        abort: false,
        drop_replica: false,
        catchup: true,
        catchup_all: false,
    };
}

/// Replicator status returned over IPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatorQueryResult {
    pub role: ReplicaRole,
    pub current_epoch: Epoch,
    pub last_acked_lsn: Option<Lsn>,
    pub first_lsn: Option<Lsn>,
    pub replication_queue_depth: usize,
}

/// Request from the agent to the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub action: ProxyAction,

    /// Host runtime the replica is registered with.
    pub runtime_id: String,

    pub failover_unit: FailoverUnitDescription,
    pub local_replica: ReplicaDescription,
    pub remote_replicas: Vec<ReplicaDescription>,
    pub service: Option<ServiceDescription>,
    pub flags: ProxyMessageFlags,
}

impl ProxyRequest {
    pub fn new(
        action: ProxyAction,
        runtime_id: impl Into<String>,
        failover_unit: FailoverUnitDescription,
        local_replica: ReplicaDescription,
    ) -> Self {
        Self {
            action,
            runtime_id: runtime_id.into(),
            failover_unit,
            local_replica,
            remote_replicas: Vec::new(),
            service: None,
            flags: ProxyMessageFlags::NONE,
        }
    }

    pub fn with_remote_replicas(mut self, remote: Vec<ReplicaDescription>) -> Self {
        // Build/remove of a secondary is always build/remove idle from the
        // proxy's perspective.
        self.remote_replicas = remote
            .into_iter()
            .map(|mut replica| {
                if replica.current_role == ReplicaRole::Secondary {
                    replica.current_role = ReplicaRole::Idle;
                }
                replica
            })
            .collect();
        self
    }

    pub fn with_service(mut self, service: ServiceDescription) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_flags(mut self, flags: ProxyMessageFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Reply from the proxy to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyReply {
    pub action: ProxyAction,
    pub failover_unit: FailoverUnitDescription,
    pub local_replica: ReplicaDescription,
    pub remote_replicas: Vec<ReplicaDescription>,
    pub outcome: OperationOutcome,

    /// Populated for `ReplicatorGetStatus`, `ReplicatorUpdateEpochAndGetStatus`
    /// and `Query`.
    pub query_result: Option<ReplicatorQueryResult>,
}

impl ProxyReply {
    pub fn success(request: &ProxyRequest) -> Self {
        Self {
            action: request.action,
            failover_unit: request.failover_unit,
            local_replica: request.local_replica.clone(),
            remote_replicas: request.remote_replicas.clone(),
            outcome: OperationOutcome::Success,
            query_result: None,
        }
    }

    pub fn failure(request: &ProxyRequest, reason: impl Into<String>) -> Self {
        Self {
            outcome: OperationOutcome::failed(reason),
            ..Self::success(request)
        }
    }

    pub fn with_query_result(mut self, result: ReplicatorQueryResult) -> Self {
        self.query_result = Some(result);
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peridot_types::{
        ConsistencyUnitId, FailoverUnitId, InstanceId, NodeId, NodeInstance, ReplicaId,
    };

    fn request() -> ProxyRequest {
        ProxyRequest::new(
            ProxyAction::ReplicatorBuildIdleReplica,
            "runtime-1",
            FailoverUnitDescription::new(
                FailoverUnitId::generate(),
                ConsistencyUnitId::generate(),
                Epoch::new(1, 1),
            ),
            ReplicaDescription::new(
                NodeInstance::new(NodeId::new(1), 1),
                ReplicaId::new(1),
                InstanceId::new(1),
            ),
        )
    }

    #[test]
    fn secondary_remotes_become_idle_for_the_proxy() {
        let remote = ReplicaDescription::new(
            NodeInstance::new(NodeId::new(2), 1),
            ReplicaId::new(2),
            InstanceId::new(1),
        )
        .with_role(ReplicaRole::Secondary);

        let request = request().with_remote_replicas(vec![remote]);
        assert_eq!(request.remote_replicas[0].current_role, ReplicaRole::Idle);
    }

    #[test]
    fn reply_echoes_request_descriptions() {
        let request = request();
        let reply = ProxyReply::success(&request);
        assert_eq!(reply.action, request.action);
        assert_eq!(reply.failover_unit, request.failover_unit);
        assert!(reply.is_success());

        let failed = ProxyReply::failure(&request, "replica not registered");
        assert!(!failed.is_success());
    }

    #[test]
    fn request_roundtrips_through_postcard() {
        let request = request().with_flags(ProxyMessageFlags {
            abort: true,
            drop_replica: false,
            catchup: false,
            catchup_all: true,
        });
        let bytes = postcard::to_allocvec(&request).unwrap();
        let back: ProxyRequest = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(request, back);
    }
}
