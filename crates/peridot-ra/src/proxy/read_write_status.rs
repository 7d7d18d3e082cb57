//! Read/write status calculation.
//!
//! The status a replica grants its callers is a pure function of the
//! proxy's lifecycle state and reconfiguration stage, expressed as const
//! two-dimensional tables: `(life-cycle state × reconfiguration stage) →
//! access value`. A value is fixed, dynamic (derived from quorum state at
//! evaluation time) or invalid (the combination is unreachable; observing
//! it is a bug).

/// Access status surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Granted,
    NoWriteQuorum,
    ReconfigurationPending,
    NoReadQuorum,
    NotPrimary,
}

/// Collapsed lifecycle dimension of the lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum LifeCycleState {
    OpeningPrimary = 0,
    ReadyPrimary = 1,
    Other = 2,
}

const LIFECYCLE_COUNT: usize = 3;

/// Reconfiguration dimension of the lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ReconfigStage {
    PreWriteStatusCatchup = 0,
    TransitioningRole = 1,
    CatchupInProgress = 2,
    CatchupCompleted = 3,
    Completed = 4,
}

const STAGE_COUNT: usize = 5;

/// The kind of reconfiguration the replica is part of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigKind {
    PromoteToPrimary,
    DemoteToSecondary,
    NoPrimaryChange,
    IdleToActive,
}

/// One cell of the lookup: fixed, dynamic or unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatusValue {
    Fixed(AccessStatus),

    /// Derived at evaluation time from `has_write_quorum`.
    Dynamic,

    /// The combination cannot occur; observing it is a contract violation.
    Invalid,
}

use AccessStatus::{Granted, NoReadQuorum, NoWriteQuorum, NotPrimary, ReconfigurationPending};
use AccessStatusValue::{Dynamic, Fixed, Invalid};

/// Write status while no reconfiguration is in flight, per lifecycle.
const WRITE_LIFECYCLE: [AccessStatusValue; LIFECYCLE_COUNT] = [
    Fixed(ReconfigurationPending), // OpeningPrimary
    Dynamic,                       // ReadyPrimary: needs min replica set + quorum
    Fixed(NotPrimary),             // Other
];

/// Read status while no reconfiguration is in flight, per lifecycle.
const READ_LIFECYCLE: [AccessStatusValue; LIFECYCLE_COUNT] = [
    Fixed(ReconfigurationPending), // OpeningPrimary
    Fixed(Granted),                // ReadyPrimary
    Fixed(NotPrimary),             // Other
];

/// Write status per reconfiguration stage, one row per reconfiguration
/// kind.
const WRITE_RECONFIG: [[AccessStatusValue; STAGE_COUNT]; 4] = [
    // PromoteToPrimary
    [
        Invalid,                       // PreWriteStatusCatchup: promote never revokes first
        Fixed(ReconfigurationPending), // TransitioningRole
        Fixed(ReconfigurationPending), // CatchupInProgress
        Dynamic,                       // CatchupCompleted
        Dynamic,                       // Completed
    ],
    // DemoteToSecondary
    [
        Fixed(ReconfigurationPending), // PreWriteStatusCatchup
        Fixed(NotPrimary),             // TransitioningRole
        Fixed(NotPrimary),             // CatchupInProgress
        Fixed(NotPrimary),             // CatchupCompleted
        Fixed(NotPrimary),             // Completed
    ],
    // NoPrimaryChange
    [
        Invalid,
        Fixed(ReconfigurationPending),
        Fixed(ReconfigurationPending),
        Dynamic,
        Dynamic,
    ],
    // IdleToActive
    [
        Invalid,
        Fixed(NotPrimary),
        Fixed(NotPrimary),
        Fixed(NotPrimary),
        Fixed(NotPrimary),
    ],
];

/// Read status per reconfiguration stage, one row per reconfiguration
/// kind.
const READ_RECONFIG: [[AccessStatusValue; STAGE_COUNT]; 4] = [
    // PromoteToPrimary: reads come up as soon as catch-up completes.
    [
        Invalid,
        Fixed(NoReadQuorum),
        Fixed(NoReadQuorum),
        Fixed(Granted),
        Fixed(Granted),
    ],
    // DemoteToSecondary: reads stay granted until the role actually moves.
    [
        Fixed(Granted),
        Fixed(NotPrimary),
        Fixed(NotPrimary),
        Fixed(NotPrimary),
        Fixed(NotPrimary),
    ],
    // NoPrimaryChange
    [
        Invalid,
        Fixed(Granted),
        Fixed(Granted),
        Fixed(Granted),
        Fixed(Granted),
    ],
    // IdleToActive
    [
        Invalid,
        Fixed(NotPrimary),
        Fixed(NotPrimary),
        Fixed(NotPrimary),
        Fixed(NotPrimary),
    ],
];

const fn kind_index(kind: ReconfigKind) -> usize {
    match kind {
        ReconfigKind::PromoteToPrimary => 0,
        ReconfigKind::DemoteToSecondary => 1,
        ReconfigKind::NoPrimaryChange => 2,
        ReconfigKind::IdleToActive => 3,
    }
}

/// Inputs to the status computation, captured under the proxy lock.
#[derive(Debug, Clone, Copy)]
pub struct StatusInputs {
    pub lifecycle: LifeCycleState,

    /// `None` outside reconfigurations.
    pub reconfig: Option<(ReconfigKind, ReconfigStage)>,

    /// Whether the replica set currently has its minimum size and a write
    /// quorum (resolves `Dynamic` cells).
    pub has_write_quorum: bool,
}

/// Computes `(read_status, write_status)`.
///
/// # Panics
///
/// Panics on an `Invalid` cell: the proxy reached an unreachable
/// combination and continuing would hand out wrong access.
pub fn compute_read_write_status(inputs: StatusInputs) -> (AccessStatus, AccessStatus) {
    let (read_value, write_value) = match inputs.reconfig {
        None => (
            READ_LIFECYCLE[inputs.lifecycle as usize],
            WRITE_LIFECYCLE[inputs.lifecycle as usize],
        ),
        Some((kind, stage)) => (
            READ_RECONFIG[kind_index(kind)][stage as usize],
            WRITE_RECONFIG[kind_index(kind)][stage as usize],
        ),
    };

    (
        resolve(read_value, inputs, AccessStatus::NoReadQuorum),
        resolve(write_value, inputs, AccessStatus::NoWriteQuorum),
    )
}

fn resolve(value: AccessStatusValue, inputs: StatusInputs, degraded: AccessStatus) -> AccessStatus {
    match value {
        Fixed(status) => status,
        Dynamic => {
            if inputs.has_write_quorum {
                AccessStatus::Granted
            } else {
                degraded
            }
        }
        Invalid => panic!(
            "invalid access status combination: {:?} / {:?}",
            inputs.lifecycle, inputs.reconfig
        ),
    }
}
