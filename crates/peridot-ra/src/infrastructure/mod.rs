//! Generic concurrency infrastructure for the agent.
//!
//! - [`Clock`]: time source abstraction (system and test clocks)
//! - [`RetryTimer`]: sequence-numbered one-shot retry timer
//! - [`JobQueue`]: bounded worker pool
//! - [`EntityMap`] / [`EntityEntry`] / [`EntityScheduler`]: per-entity
//!   serialized execution with batched job items
//! - [`BackgroundWorkManagerWithRetry`]: coalesced background work with a
//!   retry timer
//! - [`RetryPolicy`]: randomized backoff per error category

mod background;
mod clock;
mod deadlock;
mod entity;
mod job_queue;
mod retry;

pub use background::{BackgroundWorkManagerWithRetry, RetryRequirement};
pub use clock::{Clock, SystemClock, TestClock};
pub use deadlock::{DeadlockDetector, SectionGuard};
pub use entity::{
    CheckContext, CommitResult, EntityEntry, EntityMap, EntityScheduler, EntityState, JobItem,
    JobItemCheck, JobItemOutcome, MultipleEntityWork, ScheduleResult,
};
pub use job_queue::JobQueue;
pub use retry::{ErrorCategory, RetryPolicy, RetryTimer};
