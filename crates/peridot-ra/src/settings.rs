//! Reconfiguration agent settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state::{ReconfigurationPhase, RetryableErrorThresholds};

/// Tuning for the reconfiguration agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaSettings {
    /// Per-phase stuck timeouts (milliseconds).
    pub phase0_timeout_ms: u64,
    pub phase1_timeout_ms: u64,
    pub phase2_timeout_ms: u64,
    pub phase3_timeout_ms: u64,
    pub phase4_timeout_ms: u64,

    /// Minimum interval between FM message bursts.
    pub min_interval_between_fm_messages_ms: u64,

    /// Retry interval for unacknowledged FM messages.
    pub fm_message_retry_interval_ms: u64,

    /// Retry interval for the replica-up backlog after node up.
    pub replica_up_retry_interval_ms: u64,

    /// Replicas packed into one outgoing FM batch.
    pub fm_message_batch_size: usize,

    /// Upper bound for randomized per-unit retry delays.
    pub max_retry_delay_ms: u64,

    /// Escalation thresholds for replica open/reopen/change-role/close.
    pub retryable_error_thresholds: RetryableErrorThresholds,

    /// Budget for the deadlock detector armed around entity commits.
    pub deadlock_budget_ms: u64,

    /// When set, a section exceeding the deadlock budget aborts the
    /// process with a structured failure instead of logging.
    pub fail_fast_on_deadlock: bool,

    /// Worker threads servicing the job queue.
    pub worker_count: usize,

    /// Timeout handed to local store operations.
    pub store_operation_timeout_ms: u64,
}

impl Default for RaSettings {
    fn default() -> Self {
        Self {
            phase0_timeout_ms: 300_000,
            phase1_timeout_ms: 300_000,
            phase2_timeout_ms: 300_000,
            phase3_timeout_ms: 300_000,
            phase4_timeout_ms: 300_000,
            min_interval_between_fm_messages_ms: 5_000,
            fm_message_retry_interval_ms: 15_000,
            replica_up_retry_interval_ms: 10_000,
            fm_message_batch_size: 64,
            max_retry_delay_ms: 30_000,
            retryable_error_thresholds: RetryableErrorThresholds::default(),
            deadlock_budget_ms: 120_000,
            fail_fast_on_deadlock: false,
            worker_count: 4,
            store_operation_timeout_ms: 30_000,
        }
    }
}

impl RaSettings {
    /// Stuck timeout for a reconfiguration phase.
    pub fn phase_timeout(&self, phase: ReconfigurationPhase) -> Duration {
        let ms = match phase {
            ReconfigurationPhase::None => u64::MAX,
            ReconfigurationPhase::Phase0Demote => self.phase0_timeout_ms,
            ReconfigurationPhase::Phase1GetLsn => self.phase1_timeout_ms,
            ReconfigurationPhase::Phase2Catchup => self.phase2_timeout_ms,
            ReconfigurationPhase::Phase3Deactivate => self.phase3_timeout_ms,
            ReconfigurationPhase::Phase4Activate => self.phase4_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn store_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.store_operation_timeout_ms)
    }
}
