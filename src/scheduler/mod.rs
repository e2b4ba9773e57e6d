//! Scheduling for the prompt queue
//!
//! - Scheduler: priority selection and rate-limit cooldown release
//! - BackoffPolicy: when a rate-limited task may run again
//! - Recovery: requeues tasks a previous process left executing
//! - QueueManager: the tick loop tying store, runner and sessions together

mod backoff;
mod manager;
mod recovery;
mod select;

pub use backoff::BackoffPolicy;
pub use manager::{ManagerConfig, Observer, QueueManager, SESSION_OPENER_PRIORITY, TickOutcome};
pub use recovery::{RecoveryAction, SHUTDOWN_NOTE, STALE_EXECUTION_NOTE, reconcile_stale_executing};
pub use select::{IdleReason, Scheduler, Selection};
