//! Scheduler - picks the next task to run
//!
//! Lower priority value runs first. Ties go to the earlier task in the state,
//! which the store orders by creation time.

use chrono::{DateTime, Duration, Local};

use super::backoff::BackoffPolicy;
use crate::domain::{QueueState, Task, TaskStatus};
use crate::error::Result;

/// Why nothing was selected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleReason {
    /// No runnable work at all
    Empty,
    /// Everything left is waiting out a rate limit
    CoolingDown {
        rate_limited: usize,
        next_resume: Option<DateTime<Local>>,
    },
    /// Queued tasks are waiting for their session to be opened
    WaitingOnSession { waiting: usize },
}

impl std::fmt::Display for IdleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdleReason::Empty => write!(f, "No prompts in queue"),
            IdleReason::CoolingDown {
                rate_limited,
                next_resume: Some(at),
            } => write!(
                f,
                "Waiting for rate limit reset ({} rate limited, next at {})",
                rate_limited,
                at.format("%Y-%m-%d %H:%M:%S")
            ),
            IdleReason::CoolingDown { rate_limited, .. } => {
                write!(f, "Waiting for rate limit reset ({} rate limited)", rate_limited)
            }
            IdleReason::WaitingOnSession { waiting } => {
                write!(f, "{} prompts waiting for their chat session to open", waiting)
            }
        }
    }
}

/// Result of a selection pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Run this task
    Ready(String),
    Idle(IdleReason),
}

/// Scheduler selects the next task given the backoff policy
#[derive(Debug, Clone)]
pub struct Scheduler {
    policy: BackoffPolicy,
    cooldown: Duration,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(BackoffPolicy::default(), Duration::seconds(300))
    }
}

impl Scheduler {
    pub fn new(policy: BackoffPolicy, cooldown: Duration) -> Self {
        Self { policy, cooldown }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Release rate-limited tasks whose cooldown has elapsed
    ///
    /// Returns `(task_id, new_status)` for every task that moved.
    pub fn sweep_rate_limited(
        &self,
        state: &mut QueueState,
        now: DateTime<Local>,
    ) -> Result<Vec<(String, TaskStatus)>> {
        let due: Vec<String> = state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::RateLimited)
            .filter(|t| self.policy.cooldown_elapsed(t, self.cooldown, now))
            .map(|t| t.id.clone())
            .collect();

        let mut released = Vec::with_capacity(due.len());
        for id in due {
            let status = state.release_from_cooldown(&id, now)?;
            released.push((id, status));
        }
        Ok(released)
    }

    /// True if the task may run now
    fn is_runnable(state: &QueueState, task: &Task) -> bool {
        if task.status != TaskStatus::Queued {
            return false;
        }
        if task.awaits_session() {
            // Followers wait while their opener is still pending
            if let Some(placeholder) = task.session_id.as_deref() {
                return !state.has_pending_opener(placeholder);
            }
        }
        true
    }

    /// Select the next task, promoting a rate-limited one if the queue is idle
    ///
    /// Returns the ids of tasks that were moved out of `RateLimited` as the
    /// second element so the caller can persist them.
    pub fn select_next(
        &self,
        state: &mut QueueState,
        now: DateTime<Local>,
    ) -> Result<(Selection, Vec<String>)> {
        if let Some(id) = Self::lowest_priority(state) {
            return Ok((Selection::Ready(id), Vec::new()));
        }

        let mut candidates: Vec<(i64, String)> = state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::RateLimited)
            .filter(|t| self.policy.promotable(t, self.cooldown, now))
            .map(|t| (t.priority, t.id.clone()))
            .collect();
        candidates.sort_by_key(|(priority, _)| *priority);

        let mut moved = Vec::new();
        for (_, id) in candidates {
            let status = state.release_from_cooldown(&id, now)?;
            moved.push(id.clone());
            if status == TaskStatus::Queued {
                log::info!("Promoted rate-limited task {} after its reported reset", id);
                return Ok((Selection::Ready(id), moved));
            }
        }

        Ok((Selection::Idle(self.idle_reason(state)), moved))
    }

    fn lowest_priority(state: &QueueState) -> Option<String> {
        state
            .tasks
            .iter()
            .filter(|t| Self::is_runnable(state, t))
            .min_by_key(|t| t.priority)
            .map(|t| t.id.clone())
    }

    fn idle_reason(&self, state: &QueueState) -> IdleReason {
        let rate_limited: Vec<&Task> = state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::RateLimited)
            .collect();
        if !rate_limited.is_empty() {
            return IdleReason::CoolingDown {
                rate_limited: rate_limited.len(),
                next_resume: rate_limited
                    .iter()
                    .filter_map(|t| self.policy.resume_at(t, self.cooldown))
                    .min(),
            };
        }

        let waiting = state.count_by_status(TaskStatus::Queued);
        if waiting > 0 {
            IdleReason::WaitingOnSession { waiting }
        } else {
            IdleReason::Empty
        }
    }
}
