//! Queue state: the active task set plus aggregate counters
//!
//! One `QueueState` exists per storage root. The scheduler owns it for the
//! duration of an iteration and passes it explicitly; there are no globals.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::outcome::ExecutionResult;
use crate::domain::task::{Task, TaskStatus};
use crate::error::{QueueError, Result};

/// Monotonic aggregate counters persisted next to the task records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueCounters {
    pub total_processed: u64,
    pub failed_count: u64,
    pub rate_limited_count: u64,
    pub last_processed: Option<DateTime<Local>>,
}

impl QueueCounters {
    /// Fold in counters from another snapshot without ever going backwards
    pub fn merge(&mut self, other: &QueueCounters) {
        self.total_processed = self.total_processed.max(other.total_processed);
        self.failed_count = self.failed_count.max(other.failed_count);
        self.rate_limited_count = self.rate_limited_count.max(other.rate_limited_count);
        self.last_processed = match (self.last_processed, other.last_processed) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Summary used by `status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub total_tasks: usize,
    pub status_counts: BTreeMap<String, usize>,
    pub total_processed: u64,
    pub failed_count: u64,
    pub rate_limited_count: u64,
    pub last_processed: Option<DateTime<Local>>,
    /// Earliest expected reset among rate-limited tasks
    pub next_reset: Option<DateTime<Local>>,
}

/// The full in-memory queue
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueState {
    pub tasks: Vec<Task>,
    pub counters: QueueCounters,
}

impl QueueState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task, rejecting duplicate ids
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.get(&task.id).is_some() {
            return Err(QueueError::InvalidOperation(format!(
                "task {} already exists",
                task.id
            )));
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    fn require_mut(&mut self, id: &str) -> Result<&mut Task> {
        self.get_mut(id)
            .ok_or_else(|| QueueError::TaskNotFound(id.to_string()))
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Tasks still in the active queue
    pub fn active(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| !t.status.is_terminal())
    }

    /// True if a session opener for this placeholder is still pending
    pub fn has_pending_opener(&self, placeholder: &str) -> bool {
        self.active()
            .any(|t| t.is_session_start && t.session_id.as_deref() == Some(placeholder))
    }

    /// Queued -> Executing for the given task
    pub fn begin_execution(&mut self, id: &str, now: DateTime<Local>) -> Result<()> {
        self.require_mut(id)?.begin_execution(now)
    }

    /// Apply one execution result and update the aggregate counters
    pub fn apply_result(
        &mut self,
        id: &str,
        result: &ExecutionResult,
        now: DateTime<Local>,
    ) -> Result<TaskStatus> {
        let task = self.require_mut(id)?;
        let first_rate_limit = task.rate_limited_at.is_none();
        let status = task.finish(result, now)?;

        if result.is_rate_limited() && first_rate_limit {
            self.counters.rate_limited_count += 1;
        }
        match status {
            TaskStatus::Completed => {
                self.counters.total_processed += 1;
                self.counters.last_processed = Some(now);
            }
            TaskStatus::Failed => {
                self.counters.failed_count += 1;
                self.counters.last_processed = Some(now);
            }
            _ => {}
        }
        Ok(status)
    }

    /// RateLimited -> Queued | Failed for the given task
    pub fn release_from_cooldown(&mut self, id: &str, now: DateTime<Local>) -> Result<TaskStatus> {
        let status = self.require_mut(id)?.release_from_cooldown(now)?;
        if status == TaskStatus::Failed {
            self.counters.failed_count += 1;
            self.counters.last_processed = Some(now);
        }
        Ok(status)
    }

    /// Cancel a task by id
    pub fn cancel(&mut self, id: &str, now: DateTime<Local>) -> Result<()> {
        self.require_mut(id)?.cancel(now)
    }

    /// Demote every executing task back to the queue
    ///
    /// Returns the ids that were demoted.
    pub fn interrupt_executing(&mut self, now: DateTime<Local>, reason: &str) -> Vec<String> {
        self.tasks
            .iter_mut()
            .filter_map(|t| t.interrupt(now, reason).then(|| t.id.clone()))
            .collect()
    }

    /// Rewrite a placeholder session id on every non-terminal task
    ///
    /// Returns the number of tasks rewritten.
    pub fn rewrite_session(&mut self, placeholder: &str, real_session_id: &str) -> usize {
        self.tasks
            .iter_mut()
            .filter(|t| !matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled))
            .map(|t| t.rebind_session(placeholder, real_session_id))
            .filter(|rewritten| *rewritten)
            .count()
    }

    pub fn stats(&self) -> QueueStats {
        let status_counts = TaskStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), self.count_by_status(*s)))
            .collect();
        let next_reset = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::RateLimited)
            .filter_map(|t| t.reset_time)
            .min();

        QueueStats {
            total_tasks: self.tasks.len(),
            status_counts,
            total_processed: self.counters.total_processed,
            failed_count: self.counters.failed_count,
            rate_limited_count: self.counters.rate_limited_count,
            last_processed: self.counters.last_processed,
            next_reset,
        }
    }
}
