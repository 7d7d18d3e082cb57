//! # peridot-types: Core types for `Peridot`
//!
//! This crate contains shared types used across the `Peridot` system:
//! - Sequence numbers ([`Lsn`])
//! - Configuration versions ([`Epoch`], [`GenerationNumber`], [`GenerationState`])
//! - Cluster identities ([`NodeId`], [`NodeInstance`], [`ReplicaId`], [`InstanceId`])
//! - Partition identities ([`FailoverUnitId`], [`ConsistencyUnitId`])
//! - Replica state ([`ReplicaRole`], [`ReplicaLifecycle`], [`ReplicaDescription`])
//! - Service metadata ([`ServiceDescription`])
//! - Correlation ([`ActivityId`])
//! - Temporal types ([`Timestamp`])

use std::fmt::{Debug, Display};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Lsn - Copy (8-byte commit sequence number)
// ============================================================================

/// Operation log sequence number: a per-replica strictly increasing commit
/// sequence number.
///
/// Every committed transaction receives an LSN; every row carries the LSN of
/// the transaction that last modified it. LSNs observed across all rows of a
/// replica are monotonically nondecreasing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Lsn(i64);

impl Lsn {
    /// The zero LSN: no operation has been committed.
    pub const ZERO: Lsn = Lsn(0);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns the next LSN in sequence.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Distance to another (lower or equal) LSN, saturating at zero.
    pub fn gap_from(self, other: Lsn) -> u64 {
        (self.0 - other.0).max(0) as u64
    }
}

impl Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Lsn {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Lsn> for i64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

// ============================================================================
// Epoch - Copy (global configuration version of a failover unit)
// ============================================================================

/// The global version of a failover unit's configuration.
///
/// Epochs are ordered lexicographically by `(data_loss, configuration)`.
/// The data-loss number increments when a replica set loses state and is
/// logically reset; the configuration number increments on every
/// reconfiguration (primary change, membership change).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Epoch {
    /// Incremented when the replica set is logically reset after data loss.
    pub data_loss: i64,

    /// Incremented on every reconfiguration.
    pub configuration: i64,
}

impl Epoch {
    /// The invalid epoch. Sorts lowest; a failover unit with an invalid
    /// previous epoch is not reconfiguring.
    pub const INVALID: Epoch = Epoch {
        data_loss: 0,
        configuration: 0,
    };

    pub fn new(data_loss: i64, configuration: i64) -> Self {
        Self {
            data_loss,
            configuration,
        }
    }

    pub fn is_invalid(self) -> bool {
        self == Self::INVALID
    }

    /// Returns the epoch with the configuration number incremented.
    pub fn next_configuration(self) -> Self {
        Self {
            data_loss: self.data_loss,
            configuration: self.configuration + 1,
        }
    }

    /// Returns the epoch after a data loss: the data-loss number increments
    /// and the configuration number increments as well (a reset is itself a
    /// configuration change).
    pub fn next_data_loss(self) -> Self {
        Self {
            data_loss: self.data_loss + 1,
            configuration: self.configuration + 1,
        }
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.data_loss, self.configuration)
    }
}

// ============================================================================
// Generation - Copy (failover manager generation tracking)
// ============================================================================

/// A failover manager generation number.
///
/// Each failover manager (FM and FMM independently) stamps its messages with
/// a generation; the reconfiguration agent drops messages from superseded
/// generations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct GenerationNumber(i64);

impl GenerationNumber {
    pub const ZERO: GenerationNumber = GenerationNumber(0);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl Display for GenerationNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for GenerationNumber {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Which failover manager a generation (or message) belongs to.
///
/// The cluster failover manager (FM) places all user services; the bootstrap
/// failover manager (FMM) places the FM service itself. Each has an
/// independent generation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailoverManagerKind {
    Fm,
    Fmm,
}

impl Display for FailoverManagerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverManagerKind::Fm => write!(f, "FM"),
            FailoverManagerKind::Fmm => write!(f, "FMM"),
        }
    }
}

/// Generation header carried on every FM ↔ RA message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationHeader {
    pub generation: GenerationNumber,
    pub kind: FailoverManagerKind,
}

impl GenerationHeader {
    pub fn new(generation: GenerationNumber, kind: FailoverManagerKind) -> Self {
        Self { generation, kind }
    }
}

/// The three generation values tracked per failover manager on a node.
///
/// Each component is monotonically nondecreasing; the setters enforce this
/// by ignoring regressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GenerationState {
    proposed: GenerationNumber,
    receive: GenerationNumber,
    send: GenerationNumber,
}

impl GenerationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn proposed(&self) -> GenerationNumber {
        self.proposed
    }

    pub fn receive(&self) -> GenerationNumber {
        self.receive
    }

    pub fn send(&self) -> GenerationNumber {
        self.send
    }

    /// Raises the proposed generation. Returns true if the value advanced.
    pub fn set_proposed(&mut self, value: GenerationNumber) -> bool {
        if value > self.proposed {
            self.proposed = value;
            true
        } else {
            false
        }
    }

    /// Raises the receive generation. Returns true if the value advanced.
    pub fn set_receive(&mut self, value: GenerationNumber) -> bool {
        if value > self.receive {
            self.receive = value;
            true
        } else {
            false
        }
    }

    /// Raises the send generation. Returns true if the value advanced.
    pub fn set_send(&mut self, value: GenerationNumber) -> bool {
        if value > self.send {
            self.send = value;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Cluster identities - All Copy (cheap 8-16 byte values)
// ============================================================================

/// Unique identifier for a node in the cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A node identity plus its incarnation.
///
/// The instance number increments every time the node process restarts, so a
/// message from an earlier incarnation can be recognized as stale.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeInstance {
    pub id: NodeId,
    pub instance: u64,
}

impl NodeInstance {
    pub fn new(id: NodeId, instance: u64) -> Self {
        Self { id, instance }
    }

    /// True if `self` supersedes `other` (same node, newer incarnation).
    pub fn supersedes(self, other: NodeInstance) -> bool {
        self.id == other.id && self.instance > other.instance
    }
}

impl Display for NodeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.id, self.instance)
    }
}

/// Unique identifier for a replica of a failover unit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ReplicaId(i64);

impl ReplicaId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ReplicaId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// The incarnation of a replica.
///
/// A replica keeps its [`ReplicaId`] across restarts of the hosting process
/// but receives a new instance id, so a message referring to a superseded
/// instance can be recognized as stale.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct InstanceId(i64);

impl InstanceId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Partition identities
// ============================================================================

/// Unique identifier for a failover unit (a partition's failover record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FailoverUnitId(Uuid);

impl FailoverUnitId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl Display for FailoverUnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for the consistency unit a failover unit replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConsistencyUnitId(Uuid);

impl ConsistencyUnitId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl Display for ConsistencyUnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Replica roles and lifecycle
// ============================================================================

/// The replication role of a replica.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum ReplicaRole {
    #[default]
    Unknown,
    None,
    Idle,
    Secondary,
    Primary,
}

impl ReplicaRole {
    /// True if the role participates in the write quorum.
    pub fn is_in_configuration(self) -> bool {
        matches!(self, ReplicaRole::Secondary | ReplicaRole::Primary)
    }
}

impl Display for ReplicaRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplicaRole::Unknown => "U",
            ReplicaRole::None => "N",
            ReplicaRole::Idle => "I",
            ReplicaRole::Secondary => "S",
            ReplicaRole::Primary => "P",
        };
        write!(f, "{s}")
    }
}

/// The lifecycle state of a replica as tracked by the failover unit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum ReplicaLifecycle {
    /// Being built by a copy stream; not yet part of the quorum.
    InBuild,

    /// Fully caught up and serving.
    #[default]
    Ready,

    /// Drop requested; tear-down in progress.
    InDrop,

    /// Dropped; awaiting acknowledgement before the record is erased.
    Dropped,

    /// Persisted state exists but the replica is not open.
    StandBy,

    /// The hosting node or process is down.
    Down,
}

impl ReplicaLifecycle {
    pub fn is_up(self) -> bool {
        matches!(
            self,
            ReplicaLifecycle::InBuild | ReplicaLifecycle::Ready | ReplicaLifecycle::InDrop
        )
    }
}

impl Display for ReplicaLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplicaLifecycle::InBuild => "IB",
            ReplicaLifecycle::Ready => "RD",
            ReplicaLifecycle::InDrop => "ID",
            ReplicaLifecycle::Dropped => "DD",
            ReplicaLifecycle::StandBy => "SB",
            ReplicaLifecycle::Down => "DN",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Replica description
// ============================================================================

/// Everything the failover subsystem knows about one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescription {
    pub node: NodeInstance,
    pub replica_id: ReplicaId,
    pub instance_id: InstanceId,
    pub state: ReplicaLifecycle,
    pub previous_role: ReplicaRole,
    pub current_role: ReplicaRole,

    /// Highest LSN this replica has acknowledged. `None` until first reported.
    pub last_acked_lsn: Option<Lsn>,

    /// First LSN available in this replica's local store.
    pub first_lsn: Option<Lsn>,
}

impl ReplicaDescription {
    pub fn new(node: NodeInstance, replica_id: ReplicaId, instance_id: InstanceId) -> Self {
        Self {
            node,
            replica_id,
            instance_id,
            state: ReplicaLifecycle::Ready,
            previous_role: ReplicaRole::Unknown,
            current_role: ReplicaRole::Unknown,
            last_acked_lsn: None,
            first_lsn: None,
        }
    }

    pub fn with_role(mut self, role: ReplicaRole) -> Self {
        self.current_role = role;
        self
    }

    pub fn with_state(mut self, state: ReplicaLifecycle) -> Self {
        self.state = state;
        self
    }

    pub fn is_up(&self) -> bool {
        self.state.is_up()
    }

    pub fn is_in_current_configuration(&self) -> bool {
        self.current_role.is_in_configuration()
    }

    pub fn is_in_previous_configuration(&self) -> bool {
        self.previous_role.is_in_configuration()
    }
}

impl Display for ReplicaDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} {}:{} {}",
            self.previous_role, self.current_role, self.replica_id, self.instance_id, self.state
        )
    }
}

// ============================================================================
// Service description
// ============================================================================

/// The subset of a service's description the failover subsystem carries.
///
/// The full description is owned by the cluster manager; the RA needs the
/// replica-set sizing and the update version for staleness checks on
/// service-description updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub name: String,
    pub service_type: String,
    pub update_version: u64,
    pub target_replica_set_size: usize,
    pub min_replica_set_size: usize,
}

impl ServiceDescription {
    pub fn new(name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            update_version: 0,
            target_replica_set_size: 3,
            min_replica_set_size: 2,
        }
    }

    /// Quorum size for the target replica set.
    pub fn write_quorum_size(&self) -> usize {
        self.target_replica_set_size / 2 + 1
    }
}

// ============================================================================
// ActivityId - correlation identifier
// ============================================================================

/// Per-operation correlation identifier that flows through logs, traces and
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityId(Uuid);

impl ActivityId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derives a sub-activity id for fan-out work, keeping the parent
    /// recognizable in traces.
    pub fn derive(self, index: u64) -> Self {
        let (hi, lo) = self.0.as_u64_pair();
        Self(Uuid::from_u64_pair(hi, lo.wrapping_add(index).wrapping_add(1)))
    }

    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl Display for ActivityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for ActivityId {
    fn default() -> Self {
        Self::generate()
    }
}

// ============================================================================
// Error classification
// ============================================================================

/// How a failure propagates through the failover subsystem.
///
/// Each layer's error enum classifies its variants into one of these
/// categories; the retry and escalation machinery acts on the class, not
/// the concrete error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Retry locally with randomized backoff.
    Retryable,

    /// Repeated occurrences drop the replica and inform the FM.
    DropWorthy,

    /// Requires a replica reset (restore or rebuild).
    Fatal,

    /// Expected outcome (not found, already exists); no action.
    Informational,
}

// ============================================================================
// Timestamp - Copy (8-byte value with monotonic guarantee)
// ============================================================================

/// Wall-clock timestamp with monotonic guarantee within the system.
///
/// Stored as nanoseconds since Unix epoch (1970-01-01 00:00:00 UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch (1970-01-01 00:00:00 UTC).
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Creates a timestamp from nanoseconds since Unix epoch.
    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Returns the timestamp as nanoseconds since Unix epoch.
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Returns the timestamp as seconds since Unix epoch (truncates).
    pub fn as_secs(&self) -> u64 {
        self.0 / 1_000_000_000
    }

    /// Creates a timestamp for the current time.
    ///
    /// # Panics
    ///
    /// Panics if the system clock is before Unix epoch (should never happen).
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch");
        Self(duration.as_nanos() as u64)
    }

    /// Creates a timestamp ensuring monotonicity: `max(now, last + 1ns)`.
    pub fn now_monotonic(last: Option<Timestamp>) -> Self {
        let now = Self::now();
        match last {
            Some(prev) => {
                if now.0 <= prev.0 {
                    Timestamp(prev.0.saturating_add(1))
                } else {
                    now
                }
            }
            None => now,
        }
    }

    /// Elapsed duration since `earlier`, saturating at zero.
    pub fn duration_since(&self, earlier: Timestamp) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    pub fn saturating_add(&self, d: std::time::Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(d.as_nanos() as u64))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.0 / 1_000_000_000;
        let nanos = self.0 % 1_000_000_000;
        write!(f, "{secs}.{nanos:09}")
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::EPOCH
    }
}

impl From<u64> for Timestamp {
    fn from(nanos: u64) -> Self {
        Self(nanos)
    }
}

#[cfg(test)]
mod tests;
