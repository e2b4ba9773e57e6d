//! When a rate-limited task becomes eligible again.

use chrono::{DateTime, Duration, Local};
use serde::{Deserialize, Serialize};

use crate::domain::Task;

/// Which clock governs the end of a rate-limit cooldown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackoffPolicy {
    /// Wait a fixed cooldown after the limit was hit. A reported reset that
    /// passes earlier may still promote the task when nothing else is queued.
    #[default]
    FixedCooldown,
    /// Wait for the reset time estimated from the tool's output, falling back
    /// to the fixed cooldown when there is none.
    ReportedReset,
}

impl BackoffPolicy {
    /// Time the sweep releases the task; `None` means immediately
    pub fn resume_at(&self, task: &Task, cooldown: Duration) -> Option<DateTime<Local>> {
        let after_cooldown = task.rate_limited_at.map(|at| at + cooldown);
        match self {
            BackoffPolicy::FixedCooldown => after_cooldown,
            BackoffPolicy::ReportedReset => task.reset_time.or(after_cooldown),
        }
    }

    /// True once the sweep should release the task
    pub fn cooldown_elapsed(&self, task: &Task, cooldown: Duration, now: DateTime<Local>) -> bool {
        self.resume_at(task, cooldown).is_none_or(|at| at <= now)
    }

    /// True if an idle queue may pull the task forward
    pub fn promotable(&self, task: &Task, cooldown: Duration, now: DateTime<Local>) -> bool {
        self.cooldown_elapsed(task, cooldown, now) || task.reset_time.is_some_and(|at| at <= now)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffPolicy::FixedCooldown => "fixed-cooldown",
            BackoffPolicy::ReportedReset => "reported-reset",
        }
    }
}

impl std::fmt::Display for BackoffPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
