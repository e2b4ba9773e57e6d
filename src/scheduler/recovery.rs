//! Crash Recovery - requeues tasks left executing by a previous process
//!
//! Only one scheduler runs per storage root and nothing executes between
//! ticks, so an `Executing` record seen on load was abandoned. It goes back
//! to the queue without consuming a retry.

use chrono::{DateTime, Local};

use crate::domain::QueueState;

/// Log line for tasks found executing on load
pub const STALE_EXECUTION_NOTE: &str =
    "Execution interrupted (found executing on load, process did not finish it); requeued";

/// Log line for tasks demoted on graceful shutdown
pub const SHUTDOWN_NOTE: &str = "Execution interrupted during shutdown";

/// Result of recovering a single task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Task was put back in the queue
    Requeued { task_id: String },
}

/// Demote every stale `Executing` task to `Queued`
pub fn reconcile_stale_executing(state: &mut QueueState, now: DateTime<Local>) -> Vec<RecoveryAction> {
    state
        .interrupt_executing(now, STALE_EXECUTION_NOTE)
        .into_iter()
        .map(|task_id| {
            log::warn!("Recovered task {} left executing by a previous run", task_id);
            RecoveryAction::Requeued { task_id }
        })
        .collect()
}
