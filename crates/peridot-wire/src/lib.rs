//! Failover wire and IPC message definitions.
//!
//! This crate defines the message vocabulary between the failover manager
//! and the reconfiguration agent ([`message`]), the per-action routing
//! metadata the agent's dispatcher consults ([`metadata`]), and the
//! node-local IPC bodies between the agent and the failover unit proxy
//! ([`proxy`]).
//!
//! Message framing and transport are external concerns: everything here is
//! a plain serde type, canonically encoded with `postcard` when a byte form
//! is needed.

pub mod message;
pub mod metadata;
pub mod proxy;

pub use message::{
    ConfigurationBody, FailoverUnitDescription, FailoverUnitInfo, GenerationBody, GetLsnReplyBody,
    Message, MessageAction, MessageBody, NodeActivationBody, NodeUpBody, OperationOutcome,
    ReplicaListBody, ReplicaMessageBody, ReplicaReplyBody, ReportFaultBody, ServiceTypeBody,
};
pub use metadata::{MessageMetadata, MessageTarget, StalenessCheck, metadata_for};
pub use proxy::{
    ProxyAction, ProxyMessageFlags, ProxyReply, ProxyRequest, ReplicatorQueryResult,
};
