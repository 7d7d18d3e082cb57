//! Reconfiguration agent (RA) and failover unit proxy (FUP) for Peridot.
//!
//! The agent is the node-level owner of every failover unit (partition
//! replica record) on a node. It processes messages from the failover
//! manager and from in-host replicas, serializes all work per failover unit
//! through the entity scheduler, persists unit state in the local failover
//! unit map (LFUM), and drives the in-host proxy over IPC.
//!
//! # Architecture
//!
//! The state machines are pure: a message resolves to a job item; job items
//! run under the entity's exclusive lock and mutate an in-memory snapshot;
//! the snapshot commits to the local store; only then do the queued actions
//! (outgoing messages, IPC requests, timers, health reports, host
//! termination) dispatch. Nothing performs I/O while an entity lock is
//! held.
//!
//! ```text
//! FM ──msg──► dispatcher ──job item──► scheduler ──cycle──► FT state
//!                                                            │ commit
//!                                                            ▼
//!                                     actions: send / IPC / timer / health
//! ```
//!
//! # Key Types
//!
//! - [`agent::ReconfigurationAgent`]: the node singleton
//! - [`state::FailoverUnit`]: the durable per-partition record
//! - [`proxy::FailoverUnitProxy`]: the in-host mirror driving the replica
//! - [`infrastructure`]: entity map/scheduler, timers, job queue

pub mod actions;
pub mod agent;
pub mod generation;
pub mod health;
pub mod hosting;
pub mod infrastructure;
pub mod node;
pub mod proxy;
pub mod settings;
pub mod state;
pub mod upgrade;

use thiserror::Error;

/// Errors surfaced by the reconfiguration agent.
#[derive(Debug, Error)]
pub enum RaError {
    /// The agent is not open (boot incomplete or node closing).
    #[error("reconfiguration agent is not open")]
    NotOpen,

    /// The message is stale (older epoch, superseded instance, or stale
    /// generation) and was dropped.
    #[error("stale message: {0}")]
    StaleMessage(String),

    /// The target failover unit does not exist and the message may not
    /// create it.
    #[error("unknown failover unit")]
    UnknownFailoverUnit,

    /// The node is deactivated and the operation requires activation.
    #[error("node is deactivated")]
    NodeDeactivated,

    /// A proxy invariant was violated (double open, action after close).
    #[error("proxy contract violation: {0}")]
    ProxyViolation(String),

    /// An upgrade message was rejected (stale instance, wrong state).
    #[error("upgrade rejected: {0}")]
    UpgradeRejected(String),

    /// Persisted failover unit state has an unknown schema version.
    #[error("unsupported failover unit schema version {0}")]
    UnsupportedSchemaVersion(u8),

    #[error("serialization failed: {0}")]
    Codec(#[from] postcard::Error),

    #[error(transparent)]
    Store(#[from] peridot_store::StoreError),
}
