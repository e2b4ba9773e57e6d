//! Task record and its lifecycle state machine
//!
//! A Task is one prompt waiting to be sent to the external tool. Every status
//! change goes through a method on `Task`, so the legal transitions live in
//! one place:
//!
//! ```text
//! Queued -> Executing -> Completed | RateLimited | Queued (retry) | Failed
//! RateLimited -> Queued (retry) | Failed
//! Queued | RateLimited -> Cancelled
//! ```

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::domain::outcome::ExecutionResult;
use crate::error::{QueueError, Result};
use crate::id::{generate_task_id, is_placeholder_session};

/// Default retry budget for new tasks
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be selected
    Queued,
    /// Handed to the external tool
    Executing,
    /// Tool reported success
    Completed,
    /// Retry budget exhausted
    Failed,
    /// Removed by the user
    Cancelled,
    /// Tool reported quota exhaustion, cooling down
    RateLimited,
}

impl TaskStatus {
    /// All statuses, in display order
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Queued,
        TaskStatus::Executing,
        TaskStatus::RateLimited,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Returns true if no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Executing => "executing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "executing" => Ok(TaskStatus::Executing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "rate_limited" => Ok(TaskStatus::RateLimited),
            other => Err(QueueError::InvalidOperation(format!("unknown status: {}", other))),
        }
    }
}

/// One unit of schedulable work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    //=== Identity ===
    /// Short unique id, also the storage key
    pub id: String,

    /// Instruction text sent to the external tool
    pub content: String,

    //=== Execution settings ===
    /// Directory the tool is invoked from
    pub working_directory: PathBuf,

    /// Lower value runs first
    pub priority: i64,

    /// Paths referenced alongside the content; missing ones are dropped at run time
    pub context_files: Vec<String>,

    /// Retries granted after the first attempt
    pub max_retries: u32,

    /// Retries consumed so far; never decreases
    pub retry_count: u32,

    /// Informational only
    pub estimated_tokens: Option<u64>,

    //=== Session binding ===
    pub session_id: Option<String>,
    pub is_session_start: bool,
    /// Human chat name the session was created under
    pub chat_name: Option<String>,

    //=== Runtime state ===
    pub status: TaskStatus,

    /// Append-only audit trail
    pub execution_log: String,

    //=== Timestamps ===
    pub created_at: DateTime<Local>,
    pub last_executed: Option<DateTime<Local>>,
    pub rate_limited_at: Option<DateTime<Local>>,
    /// Tool-reported or estimated quota reset
    pub reset_time: Option<DateTime<Local>>,
}

impl Task {
    /// Create a new queued task
    pub fn new(content: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            id: generate_task_id(),
            content: content.into().trim().to_string(),
            working_directory: working_directory.into(),
            priority: 0,
            context_files: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
            estimated_tokens: None,
            session_id: None,
            is_session_start: false,
            chat_name: None,
            status: TaskStatus::Queued,
            execution_log: String::new(),
            created_at: Local::now(),
            last_executed: None,
            rate_limited_at: None,
            reset_time: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set context files, dropping duplicates while keeping order
    pub fn with_context_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context_files.clear();
        for file in files {
            let file = file.into();
            if !self.context_files.contains(&file) {
                self.context_files.push(file);
            }
        }
        self
    }

    pub fn with_estimated_tokens(mut self, tokens: Option<u64>) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    /// Bind the task to an existing (or placeholder) session
    pub fn with_session(mut self, session_id: impl Into<String>, chat_name: Option<String>) -> Self {
        self.session_id = Some(session_id.into());
        self.chat_name = chat_name;
        self
    }

    /// Mark the task as the opener of a new session
    pub fn as_session_start(mut self) -> Self {
        self.is_session_start = true;
        self
    }

    /// Append a timestamped log line
    pub fn add_log(&mut self, message: &str) {
        self.add_log_at(Local::now(), message);
    }

    /// Append a log line stamped with the given time
    pub fn add_log_at(&mut self, at: DateTime<Local>, message: &str) {
        self.execution_log
            .push_str(&format!("[{}] {}\n", at.format("%Y-%m-%d %H:%M:%S"), message));
    }

    /// True while a retry may still be granted
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Grant one retry if budget remains
    fn consume_retry(&mut self) -> bool {
        if self.can_retry() {
            self.retry_count += 1;
            true
        } else {
            false
        }
    }

    /// True if the task waits on a session that does not exist yet
    pub fn awaits_session(&self) -> bool {
        !self.is_session_start
            && self
                .session_id
                .as_deref()
                .is_some_and(is_placeholder_session)
    }

    /// Attempt number of the next (or current) run, 1-based
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    fn ensure_not_terminal(&self, action: &str) -> Result<()> {
        if self.status.is_terminal() {
            return Err(QueueError::InvalidOperation(format!(
                "cannot {} task {}: already {}",
                action, self.id, self.status
            )));
        }
        Ok(())
    }

    /// Queued -> Executing
    pub fn begin_execution(&mut self, now: DateTime<Local>) -> Result<()> {
        if self.status != TaskStatus::Queued {
            return Err(QueueError::InvalidOperation(format!(
                "cannot start task {}: status is {}",
                self.id, self.status
            )));
        }
        self.status = TaskStatus::Executing;
        self.last_executed = Some(now);
        let message = format!(
            "Started execution (attempt {}/{})",
            self.attempt(),
            self.max_retries + 1
        );
        self.add_log_at(now, &message);
        Ok(())
    }

    /// Executing -> Completed | RateLimited | Queued | Failed
    ///
    /// Returns the new status.
    pub fn finish(&mut self, result: &ExecutionResult, now: DateTime<Local>) -> Result<TaskStatus> {
        if self.status != TaskStatus::Executing {
            return Err(QueueError::InvalidOperation(format!(
                "cannot record a result for task {}: status is {}",
                self.id, self.status
            )));
        }
        let summary = result.summary();

        if let Some(info) = &result.rate_limit {
            self.rate_limited_at = Some(now);
            self.reset_time = info.reset_time;
            self.add_log_at(now, &format!("{} - RATE LIMITED", summary));
            if !info.message.is_empty() {
                self.add_log_at(now, &format!("Message: {}", info.message));
            }
            if self.consume_retry() {
                self.status = TaskStatus::RateLimited;
                if let Some(reset) = info.reset_time {
                    self.add_log_at(now, &format!("Expected reset at {}", reset.format("%Y-%m-%d %H:%M:%S")));
                }
            } else {
                self.status = TaskStatus::Failed;
                self.add_log_at(
                    now,
                    &format!("Max retries ({}) exceeded while rate limited", self.max_retries),
                );
            }
        } else if result.success {
            self.status = TaskStatus::Completed;
            self.add_log_at(now, &format!("{} - SUCCESS", summary));
            if !result.output.is_empty() {
                self.add_log_at(now, &format!("Output:\n{}", result.output.trim_end()));
            }
        } else if self.consume_retry() {
            self.status = TaskStatus::Queued;
            self.add_log_at(now, &format!("{} - FAILED (will retry)", summary));
            if !result.error.is_empty() {
                self.add_log_at(now, &format!("Error: {}", result.error.trim_end()));
            }
        } else {
            self.status = TaskStatus::Failed;
            self.add_log_at(now, &format!("{} - FAILED (max retries exceeded)", summary));
            if !result.error.is_empty() {
                self.add_log_at(now, &format!("Error: {}", result.error.trim_end()));
            }
        }

        Ok(self.status)
    }

    /// RateLimited -> Queued | Failed, once the cooldown has passed
    ///
    /// The retry was already granted when the limit was hit, so the task goes
    /// back to the queue unless its counters were pushed past the budget.
    pub fn release_from_cooldown(&mut self, now: DateTime<Local>) -> Result<TaskStatus> {
        if self.status != TaskStatus::RateLimited {
            return Err(QueueError::InvalidOperation(format!(
                "task {} is not rate limited (status {})",
                self.id, self.status
            )));
        }
        if self.retry_count <= self.max_retries {
            self.status = TaskStatus::Queued;
            self.add_log_at(now, "Retrying after rate limit cooldown");
        } else {
            self.status = TaskStatus::Failed;
            self.add_log_at(now, &format!("Max retries ({}) exceeded", self.max_retries));
        }
        Ok(self.status)
    }

    /// Any non-terminal, non-executing status -> Cancelled
    pub fn cancel(&mut self, now: DateTime<Local>) -> Result<()> {
        self.ensure_not_terminal("cancel")?;
        if self.status == TaskStatus::Executing {
            return Err(QueueError::InvalidOperation(format!(
                "cannot cancel task {}: it is executing",
                self.id
            )));
        }
        self.status = TaskStatus::Cancelled;
        self.add_log_at(now, "Cancelled by user");
        Ok(())
    }

    /// Executing -> Queued without consuming a retry
    ///
    /// Used on shutdown and when a stale executing record is found on load.
    pub fn interrupt(&mut self, now: DateTime<Local>, reason: &str) -> bool {
        if self.status != TaskStatus::Executing {
            return false;
        }
        self.status = TaskStatus::Queued;
        self.add_log_at(now, reason);
        true
    }

    /// Replace a placeholder session id with the real one
    pub fn rebind_session(&mut self, placeholder: &str, real_session_id: &str) -> bool {
        if self.session_id.as_deref() != Some(placeholder) {
            return false;
        }
        self.session_id = Some(real_session_id.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::outcome::RateLimitInfo;
    use std::time::Duration;

    fn limit_info(now: DateTime<Local>) -> RateLimitInfo {
        RateLimitInfo {
            reset_time: Some(now + chrono::Duration::hours(1)),
            matched_phrase: "usage limit reached".to_string(),
            message: "usage limit reached".to_string(),
            detected_at: now,
        }
    }

    fn executing(max_retries: u32) -> Task {
        let mut task = Task::new("Fix the login bug", ".").with_max_retries(max_retries);
        task.begin_execution(Local::now()).unwrap();
        task
    }

    #[test]
    fn test_task_status_is_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Executing.is_terminal());
        assert!(!TaskStatus::RateLimited.is_terminal());
    }

    #[test]
    fn test_task_status_from_str() {
        assert_eq!("rate-limited".parse::<TaskStatus>().unwrap(), TaskStatus::RateLimited);
        assert_eq!("Queued".parse::<TaskStatus>().unwrap(), TaskStatus::Queued);
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_task_status_serialization() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::RateLimited).unwrap(),
            "\"rate_limited\""
        );
        assert_eq!(serde_json::to_string(&TaskStatus::Queued).unwrap(), "\"queued\"");
    }

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("  Write docs \n", "/tmp");
        assert_eq!(task.content, "Write docs");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.id.len(), 8);
        assert!(task.execution_log.is_empty());
    }

    #[test]
    fn test_context_files_are_deduplicated_in_order() {
        let task = Task::new("x", ".").with_context_files(["b.rs", "a.rs", "b.rs"]);
        assert_eq!(task.context_files, vec!["b.rs".to_string(), "a.rs".to_string()]);
    }

    #[test]
    fn test_begin_execution_logs_attempt() {
        let task = executing(2);
        assert_eq!(task.status, TaskStatus::Executing);
        assert!(task.last_executed.is_some());
        assert!(task.execution_log.contains("Started execution (attempt 1/3)"));
    }

    #[test]
    fn test_begin_execution_requires_queued() {
        let mut task = executing(2);
        assert!(task.begin_execution(Local::now()).is_err());
    }

    #[test]
    fn test_finish_success_completes() {
        let mut task = executing(2);
        let status = task
            .finish(&ExecutionResult::success("all good\n", Duration::from_secs(3)), Local::now())
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);
        assert!(task.execution_log.contains("SUCCESS"));
        assert!(task.execution_log.contains("Output:\nall good"));
    }

    #[test]
    fn test_failure_retries_until_budget_exhausted() {
        let mut task = Task::new("flaky", ".").with_max_retries(2);
        let failure = ExecutionResult::failure("exit 1", Duration::from_secs(1));

        for expected in [TaskStatus::Queued, TaskStatus::Queued, TaskStatus::Failed] {
            task.begin_execution(Local::now()).unwrap();
            assert_eq!(task.finish(&failure, Local::now()).unwrap(), expected);
        }
        assert_eq!(task.retry_count, 2);
        assert!(task.execution_log.contains("FAILED (max retries exceeded)"));
    }

    #[test]
    fn test_rate_limit_stamps_and_consumes_retry() {
        let now = Local::now();
        let mut task = executing(3);
        let status = task
            .finish(&ExecutionResult::rate_limited(limit_info(now), Duration::ZERO), now)
            .unwrap();
        assert_eq!(status, TaskStatus::RateLimited);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.rate_limited_at, Some(now));
        assert!(task.reset_time.is_some());
        assert!(task.execution_log.contains("RATE LIMITED"));
    }

    #[test]
    fn test_rate_limit_without_budget_fails() {
        let now = Local::now();
        let mut task = executing(0);
        let status = task
            .finish(&ExecutionResult::rate_limited(limit_info(now), Duration::ZERO), now)
            .unwrap();
        assert_eq!(status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn test_release_from_cooldown_requeues() {
        let now = Local::now();
        let mut task = executing(3);
        task.finish(&ExecutionResult::rate_limited(limit_info(now), Duration::ZERO), now)
            .unwrap();
        assert_eq!(task.release_from_cooldown(now).unwrap(), TaskStatus::Queued);
        assert!(task.execution_log.contains("Retrying after rate limit cooldown"));
    }

    #[test]
    fn test_release_from_cooldown_fails_when_over_budget() {
        let mut task = Task::new("edited by hand", ".").with_max_retries(1);
        task.status = TaskStatus::RateLimited;
        task.retry_count = 2;
        assert_eq!(task.release_from_cooldown(Local::now()).unwrap(), TaskStatus::Failed);
    }

    #[test]
    fn test_cancel_rejects_executing() {
        let mut task = executing(1);
        let err = task.cancel(Local::now()).unwrap_err();
        assert!(matches!(err, QueueError::InvalidOperation(_)));
        assert_eq!(task.status, TaskStatus::Executing);
    }

    #[test]
    fn test_cancel_queued_and_rate_limited() {
        let mut queued = Task::new("a", ".");
        queued.cancel(Local::now()).unwrap();
        assert_eq!(queued.status, TaskStatus::Cancelled);

        let mut limited = Task::new("b", ".");
        limited.status = TaskStatus::RateLimited;
        limited.cancel(Local::now()).unwrap();
        assert_eq!(limited.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        let mut task = executing(1);
        task.finish(&ExecutionResult::success("", Duration::ZERO), Local::now())
            .unwrap();
        assert!(task.cancel(Local::now()).is_err());
        assert!(task.begin_execution(Local::now()).is_err());
        assert!(task.release_from_cooldown(Local::now()).is_err());
        assert!(!task.interrupt(Local::now(), "interrupted"));
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_interrupt_requeues_without_consuming_retry() {
        let mut task = executing(1);
        assert!(task.interrupt(Local::now(), "Execution interrupted during shutdown"));
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 0);
        assert!(task.execution_log.contains("interrupted"));
    }

    #[test]
    fn test_awaits_session() {
        let follower = Task::new("next", ".").with_session("temp-api-1a2b3c4d", Some("api".into()));
        assert!(follower.awaits_session());

        let opener = Task::new("first", ".")
            .with_session("temp-api-1a2b3c4d", Some("api".into()))
            .as_session_start();
        assert!(!opener.awaits_session());

        let bound = Task::new("more", ".").with_session("0b7c1e52-0000-4000-8000-000000000000", None);
        assert!(!bound.awaits_session());
    }

    #[test]
    fn test_rebind_session_only_matches_placeholder() {
        let mut task = Task::new("x", ".").with_session("temp-a-1", None);
        assert!(!task.rebind_session("temp-b-2", "real"));
        assert!(task.rebind_session("temp-a-1", "real"));
        assert_eq!(task.session_id.as_deref(), Some("real"));
    }

    #[test]
    fn test_log_is_append_only() {
        let mut task = Task::new("x", ".");
        task.add_log("first");
        let before = task.execution_log.clone();
        task.add_log("second");
        assert!(task.execution_log.starts_with(&before));
        assert!(task.execution_log.ends_with("second\n"));
    }
}
