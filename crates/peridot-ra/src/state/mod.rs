//! Durable failover unit state.

mod failover_unit;
mod fm_message;
mod reconfiguration;
mod retryable_error;

pub use failover_unit::{DeactivationInfo, FailoverUnit, FT_STATE_VERSION};
pub use fm_message::FmMessageStage;
pub use reconfiguration::{
    ReconfigurationPhase, ReconfigurationState, ReplicaProgress, StuckReason,
};
pub use retryable_error::{RetryableErrorAction, RetryableErrorState, RetryableErrorThresholds};
