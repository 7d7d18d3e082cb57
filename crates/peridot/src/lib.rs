//! # Peridot
//!
//! A durable, strongly-consistent per-partition replicated key-value store
//! with a reconfiguration agent for replica lifecycle orchestration.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Peridot node                        │
//! │  ┌──────────┐   ┌─────────────┐   ┌─────────┐   ┌─────────┐ │
//! │  │  Local   │ ← │ Replicated  │ ← │   RA    │ ↔ │   FUP   │ │
//! │  │  store   │   │    store    │   │ (agent) │   │ (proxy) │ │
//! │  └──────────┘   └─────────────┘   └─────────┘   └─────────┘ │
//! │    commit log     quorum commit     per-FT FSM    replica   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! - the **local store** persists LSN-tagged rows in a checksummed commit
//!   log ([`LogKvStore`])
//! - the **replicated store** wraps it with quorum commit, copy streams,
//!   notifications and tombstone cleanup ([`ReplicatedStore`])
//! - the **reconfiguration agent** owns every failover unit on the node
//!   and drives replica lifecycle through the in-host proxy
//!   ([`ReconfigurationAgent`])
//!
//! # Quick Start
//!
//! ```ignore
//! use peridot::{PeridotNode, PeridotConfig};
//!
//! let config = PeridotConfig::load()?;
//! let node = PeridotNode::open(config)?;
//!
//! // Feed failover messages and drive timers from the embedding fabric.
//! node.agent().process_message(&message)?;
//! node.agent().process_timer_tick();
//! ```

mod node;

pub use node::{NodeCollaborators, NodeError, PeridotNode};

// Re-export core types
pub use peridot_types::{
    ActivityId, ConsistencyUnitId, Epoch, FailoverManagerKind, FailoverUnitId, GenerationNumber,
    Lsn, NodeId, NodeInstance, ReplicaDescription, ReplicaId, ReplicaLifecycle, ReplicaRole,
    ServiceDescription, Timestamp,
};

// Storage layer
pub use peridot_store::{
    BackupMode, Isolation, LocalStore, LocalStoreSettings, LogKvStore, Row, StoreError,
};

// Replicated store
pub use peridot_replication::{
    ChannelReplicator, CommitOutcome, CopyMode, ReplicatedStore, ReplicatedStoreSettings,
    ReplicationError, SecondaryNotificationMode, WriteStatus,
};

// Failover
pub use peridot_ra::agent::ReconfigurationAgent;
pub use peridot_ra::proxy::FailoverUnitProxy;
pub use peridot_wire::{Message, MessageAction, MessageBody};

// Configuration
pub use peridot_config::{ConfigLoader, PeridotConfig};
