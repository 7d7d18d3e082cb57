//! Node assembly: wires the local store, the agent and its collaborators.

use std::sync::Arc;

use peridot_config::PeridotConfig;
use peridot_ra::agent::{MessageSender, RaDependencies, ReconfigurationAgent, RecordingSender};
use peridot_ra::health::{HealthSink, NullHealthSink};
use peridot_ra::hosting::{HostTerminator, LoopbackChannel, ProxyChannel, RecordingTerminator};
use peridot_ra::infrastructure::SystemClock;
use peridot_store::api::LocalStoreAdapter;
use peridot_store::{LogKvStore, StoreError};
use peridot_types::{ActivityId, NodeId, NodeInstance};
use thiserror::Error;

/// Errors opening or running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Agent(#[from] peridot_ra::RaError),
}

/// Optional collaborator overrides for embedding.
pub struct NodeCollaborators {
    pub sender: Arc<dyn MessageSender>,
    pub proxy_channel: Arc<dyn ProxyChannel>,
    pub health: Arc<dyn HealthSink>,
    pub terminator: Arc<dyn HostTerminator>,
}

impl Default for NodeCollaborators {
    fn default() -> Self {
        Self {
            sender: Arc::new(RecordingSender::new()),
            proxy_channel: Arc::new(LoopbackChannel::new()),
            health: Arc::new(NullHealthSink),
            terminator: Arc::new(RecordingTerminator::new()),
        }
    }
}

/// One Peridot node: the local failover unit map store plus the
/// reconfiguration agent over it.
pub struct PeridotNode {
    node: NodeInstance,
    agent: ReconfigurationAgent,
    lfum_store: Arc<LocalStoreAdapter<LogKvStore>>,
}

impl PeridotNode {
    /// Opens the node with default (recording/loopback) collaborators.
    pub fn open(config: PeridotConfig) -> Result<Self, NodeError> {
        Self::open_with(config, NodeCollaborators::default())
    }

    /// Opens the node with the embedder's collaborators.
    pub fn open_with(
        config: PeridotConfig,
        collaborators: NodeCollaborators,
    ) -> Result<Self, NodeError> {
        let node = NodeInstance::new(NodeId::new(config.node.node_id), 1);

        let engine = Arc::new(LogKvStore::open(config.local_store.clone())?);
        let lfum_store = Arc::new(LocalStoreAdapter::new(engine));

        let agent = ReconfigurationAgent::new(
            node,
            config.ra.clone(),
            RaDependencies {
                store: lfum_store.clone(),
                sender: collaborators.sender,
                proxy_channel: collaborators.proxy_channel,
                health: collaborators.health,
                terminator: collaborators.terminator,
                clock: Arc::new(SystemClock::new()),
            },
        );
        agent.open(ActivityId::generate())?;

        Ok(Self {
            node,
            agent,
            lfum_store,
        })
    }

    pub fn node(&self) -> NodeInstance {
        self.node
    }

    pub fn agent(&self) -> &ReconfigurationAgent {
        &self.agent
    }

    /// Closes the node: the agent stops accepting work and the local
    /// failover unit map flushes.
    pub fn close(&self) {
        self.agent.begin_close();
        self.agent.finish_close();
        let _ = self.lfum_store;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peridot_config::PeridotConfig;

    #[test]
    fn node_opens_and_closes_over_a_fresh_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PeridotConfig::default();
        config.node.node_id = 3;
        config.node.data_root = dir.path().to_path_buf();
        config.resolve_paths(dir.path());

        let node = PeridotNode::open(config).unwrap();
        assert_eq!(node.node().id, NodeId::new(3));
        assert_eq!(node.agent().failover_unit_count(), 0);
        node.close();
    }

    #[test]
    fn node_reload_sees_persisted_units() {
        use peridot_types::{Epoch, FailoverUnitId, InstanceId, ReplicaDescription, ReplicaId};
        use peridot_wire::{
            FailoverUnitDescription, Message, MessageBody, ReplicaMessageBody,
        };

        let dir = tempfile::tempdir().unwrap();
        let make_config = || {
            let mut config = PeridotConfig::default();
            config.node.node_id = 3;
            config.node.data_root = dir.path().to_path_buf();
            config.resolve_paths(dir.path());
            config
        };

        let ft_id = FailoverUnitId::generate();
        {
            let node = PeridotNode::open(make_config()).unwrap();
            let body = MessageBody::ReplicaOpen(ReplicaMessageBody {
                failover_unit: FailoverUnitDescription::new(
                    ft_id,
                    peridot_types::ConsistencyUnitId::generate(),
                    Epoch::new(1, 1),
                ),
                replica: ReplicaDescription::new(
                    node.node(),
                    ReplicaId::new(1),
                    InstanceId::new(1),
                ),
                service: Some(peridot_types::ServiceDescription::new(
                    "fabric:/app/kv",
                    "KvServiceType",
                )),
            });
            let message = Message::new(
                NodeInstance::new(NodeId::new(100), 1),
                ActivityId::generate(),
                body,
            );
            node.agent().process_message(&message).unwrap();
            assert_eq!(node.agent().failover_unit_count(), 1);
            node.close();
        }

        let node = PeridotNode::open(make_config()).unwrap();
        assert_eq!(node.agent().failover_unit_count(), 1);
        assert!(node.agent().failover_unit(ft_id).is_some());
    }
}
