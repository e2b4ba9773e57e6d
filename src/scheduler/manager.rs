//! Queue Manager for running queued prompts one at a time.
//!
//! Each tick:
//! 1. Writes back state a failed save left behind, then reloads from the store
//! 2. Requeues tasks a previous process left executing
//! 3. Releases rate-limited tasks whose cooldown is over
//! 4. Selects and runs the next task, applies the result, persists
//! 5. Reports the refreshed state to the observer

use chrono::{DateTime, Local};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, TaskDefaults};
use crate::detect::RateLimitDetector;
use crate::domain::{ExecutionResult, QueueState, QueueStats, Task, TaskStatus};
use crate::error::{QueueError, Result};
use crate::id::{chat_name_from_placeholder, generate_placeholder_session_id, generate_session_id, is_placeholder_session};
use crate::runner::{RunOutput, RunRequest, Runner, SessionMode};
use crate::scheduler::backoff::BackoffPolicy;
use crate::scheduler::recovery::{RecoveryAction, SHUTDOWN_NOTE, reconcile_stale_executing};
use crate::scheduler::select::{IdleReason, Scheduler, Selection};
use crate::session::{ChatSession, SessionDirectory, TranscriptEntry, append_transcript};
use crate::store::QueueStore;

/// Priority given to session openers so they run before their followers
pub const SESSION_OPENER_PRIORITY: i64 = -1;

/// Configuration for the QueueManager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Sleep between ticks
    pub check_interval: Duration,
    /// Limit on one external tool run
    pub timeout: Duration,
    /// Fixed wait after a rate limit
    pub cooldown: chrono::Duration,
    pub backoff: BackoffPolicy,
    /// Applied to tasks the manager creates itself
    pub defaults: TaskDefaults,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ManagerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            check_interval: config.scheduler.check_interval(),
            timeout: config.runner.timeout(),
            cooldown: config.scheduler.cooldown(),
            backoff: config.scheduler.backoff,
            defaults: config.defaults.clone(),
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_cooldown(mut self, cooldown: chrono::Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing was run
    Idle(IdleReason),
    /// A task ran and moved to `status`
    Executed {
        task_id: String,
        status: TaskStatus,
        /// False if the result is only in memory and will be written next tick
        persisted: bool,
    },
    /// The store could not be read or written; nothing advanced
    StoreUnavailable(String),
}

/// Callback invoked with the refreshed state after every tick
pub type Observer = Box<dyn Fn(&QueueState) -> Result<()> + Send + Sync>;

/// QueueManager owns the in-memory queue and drives execution.
pub struct QueueManager {
    config: ManagerConfig,
    scheduler: Scheduler,
    detector: RateLimitDetector,
    store: Box<dyn QueueStore>,
    runner: Arc<dyn Runner>,
    sessions: Arc<dyn SessionDirectory>,
    transcripts_dir: Option<PathBuf>,
    observer: Option<Observer>,
    state: QueueState,
    /// State has been loaded at least once
    loaded: bool,
    /// In-memory state is ahead of the store
    dirty: bool,
}

impl QueueManager {
    pub fn new(
        config: ManagerConfig,
        store: Box<dyn QueueStore>,
        runner: Arc<dyn Runner>,
        sessions: Arc<dyn SessionDirectory>,
        detector: RateLimitDetector,
    ) -> Self {
        let scheduler = Scheduler::new(config.backoff, config.cooldown);
        Self {
            config,
            scheduler,
            detector,
            store,
            runner,
            sessions,
            transcripts_dir: None,
            observer: None,
            state: QueueState::new(),
            loaded: false,
            dirty: false,
        }
    }

    /// Report state after each tick
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&QueueState) -> Result<()> + Send + Sync + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Append completed session prompts to transcripts in `dir`
    pub fn with_transcripts(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transcripts_dir = Some(dir.into());
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Last loaded in-memory state
    pub fn state(&self) -> &QueueState {
        &self.state
    }

    /// Probe the runner and load the queue.
    ///
    /// An unreachable tool is the one error that stops the loop before it
    /// starts.
    pub async fn startup(&mut self) -> Result<String> {
        let message = self.runner.check_available().await?;
        log::info!("Runner check passed: {}", message);

        let recovered = self.reload(Local::now())?;
        log::info!(
            "Loaded queue with {} tasks ({} recovered)",
            self.state.tasks.len(),
            recovered.len()
        );
        Ok(message)
    }

    /// Run ticks until `shutdown` resolves, then persist and return.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        log::info!(
            "Queue manager running (interval {}s, backoff {})",
            self.config.check_interval.as_secs(),
            self.scheduler.policy()
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                outcome = self.tick() => log_outcome(&outcome),
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.config.check_interval) => {}
            }
        }

        log::info!("Shutdown requested");
        self.shutdown()
    }

    /// One scheduler iteration
    pub async fn tick(&mut self) -> TickOutcome {
        let now = Local::now();
        if let Err(e) = self.reload(now) {
            log::error!("Failed to load queue state: {}", e);
            return TickOutcome::StoreUnavailable(e.to_string());
        }

        let released = match self.scheduler.sweep_rate_limited(&mut self.state, now) {
            Ok(released) => released,
            Err(e) => return TickOutcome::StoreUnavailable(e.to_string()),
        };
        for (task_id, status) in &released {
            tracing::info!(task_id = %task_id, status = %status, "Rate limit cooldown over");
        }

        let (selection, promoted) = match self.scheduler.select_next(&mut self.state, now) {
            Ok(selected) => selected,
            Err(e) => return TickOutcome::StoreUnavailable(e.to_string()),
        };

        if (!released.is_empty() || !promoted.is_empty()) && !self.persist() {
            return TickOutcome::StoreUnavailable("failed to persist released tasks".to_string());
        }

        let outcome = match selection {
            Selection::Idle(reason) => {
                log::info!("Idle: {}", reason);
                TickOutcome::Idle(reason)
            }
            Selection::Ready(task_id) => self.execute(&task_id).await,
        };
        self.notify();
        outcome
    }

    /// Requeue anything still executing and persist everything.
    pub fn shutdown(&mut self) -> Result<()> {
        if !self.loaded {
            return Ok(());
        }
        let interrupted = self.state.interrupt_executing(Local::now(), SHUTDOWN_NOTE);
        for task_id in &interrupted {
            tracing::warn!(task_id = %task_id, "Execution interrupted during shutdown");
        }
        self.store.save_state(&self.state)?;
        self.dirty = false;
        log::info!("Queue state saved");
        Ok(())
    }

    //=== Queue operations ===

    /// Add a task to the queue and persist it
    pub fn submit(&mut self, task: Task) -> Result<String> {
        self.refresh()?;
        let task_id = task.id.clone();
        self.state.add_task(task)?;

        if let Some(task) = self.state.get(&task_id)
            && let Err(e) = self.store.save_task(task)
        {
            self.state.tasks.retain(|t| t.id != task_id);
            return Err(e);
        }
        log::info!("Added task {}", task_id);
        Ok(task_id)
    }

    /// Cancel a task that is not executing
    pub fn cancel(&mut self, task_id: &str) -> Result<()> {
        self.refresh()?;
        let Some(before) = self.state.get(task_id).cloned() else {
            return match self.store.load_archived()?.into_iter().find(|t| t.id == task_id) {
                Some(task) => Err(QueueError::InvalidOperation(format!(
                    "cannot cancel task {}: already {}",
                    task_id, task.status
                ))),
                None => Err(QueueError::TaskNotFound(task_id.to_string())),
            };
        };

        self.state.cancel(task_id, Local::now())?;
        if let Some(task) = self.state.get(task_id)
            && let Err(e) = self.store.save_task(task)
        {
            if let Some(slot) = self.state.get_mut(task_id) {
                *slot = before;
            }
            return Err(e);
        }
        log::info!("Cancelled task {}", task_id);
        Ok(())
    }

    /// Queue the opener of a new named chat
    ///
    /// Returns the opener task. Its placeholder session id can be given to
    /// follow-up prompts before the chat has really started.
    pub fn create_chat(&mut self, name: &str, prompt: &str, working_directory: &Path) -> Result<Task> {
        let name = name.trim();
        if name.is_empty() {
            return Err(QueueError::InvalidOperation("chat name must not be empty".to_string()));
        }
        self.refresh()?;
        if self.sessions.exists(name)? || self.pending_opener(name).is_some() {
            return Err(QueueError::InvalidOperation(format!("chat '{}' already exists", name)));
        }

        let task = Task::new(prompt, working_directory)
            .with_priority(SESSION_OPENER_PRIORITY)
            .with_max_retries(self.config.defaults.max_retries)
            .with_session(generate_placeholder_session_id(name), Some(name.to_string()))
            .as_session_start();
        self.submit(task.clone())?;
        Ok(task)
    }

    /// Session id for a chat name: the real one if the chat has started,
    /// otherwise the placeholder of its pending opener
    pub fn find_session(&mut self, name: &str) -> Result<Option<String>> {
        if let Some(session_id) = self.sessions.resolve(name)? {
            return Ok(Some(session_id));
        }
        self.refresh()?;
        Ok(self.pending_opener(name).and_then(|t| t.session_id.clone()))
    }

    pub fn status(&mut self) -> Result<QueueStats> {
        self.refresh()?;
        Ok(self.state.stats())
    }

    /// Active tasks, optionally followed by archived ones
    pub fn tasks(&mut self, include_archived: bool) -> Result<Vec<Task>> {
        self.refresh()?;
        let mut tasks = self.state.tasks.clone();
        if include_archived {
            tasks.extend(self.store.load_archived()?);
        }
        Ok(tasks)
    }

    pub fn find_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.store.find_task(task_id)
    }

    pub fn chats(&self) -> Result<Vec<ChatSession>> {
        self.sessions.list()
    }

    //=== Internals ===

    fn pending_opener(&self, name: &str) -> Option<&Task> {
        self.state
            .active()
            .find(|t| t.is_session_start && t.chat_name.as_deref() == Some(name))
    }

    /// Write back unsaved state, then load from the store
    fn refresh(&mut self) -> Result<()> {
        if self.dirty {
            self.store.save_state(&self.state)?;
            self.dirty = false;
            log::info!("Wrote back queue state from a failed save");
        }
        let mut loaded = self.store.load_state()?;
        loaded.counters.merge(&self.state.counters);
        self.state = loaded;
        self.loaded = true;
        Ok(())
    }

    /// Refresh and requeue stale executing tasks
    fn reload(&mut self, now: DateTime<Local>) -> Result<Vec<RecoveryAction>> {
        self.refresh()?;
        let actions = reconcile_stale_executing(&mut self.state, now);
        for action in &actions {
            let RecoveryAction::Requeued { task_id } = action;
            if let Some(task) = self.state.get(task_id) {
                self.store.save_task(task)?;
            }
        }
        Ok(actions)
    }

    /// Save the whole state; on failure keep it for the next tick
    fn persist(&mut self) -> bool {
        match self.store.save_state(&self.state) {
            Ok(()) => {
                self.dirty = false;
                true
            }
            Err(e) => {
                log::error!("Failed to persist queue state, will retry next tick: {}", e);
                self.dirty = true;
                false
            }
        }
    }

    fn notify(&self) {
        if let Some(observer) = &self.observer
            && let Err(e) = observer(&self.state)
        {
            log::warn!("Observer failed: {}", e);
        }
    }

    async fn execute(&mut self, task_id: &str) -> TickOutcome {
        let started = Local::now();
        let Some(before) = self.state.get(task_id).cloned() else {
            log::error!("Selected task {} is missing from the queue", task_id);
            return TickOutcome::Idle(IdleReason::Empty);
        };

        if let Err(e) = self.state.begin_execution(task_id, started) {
            log::error!("Cannot start task {}: {}", task_id, e);
            return TickOutcome::Idle(IdleReason::Empty);
        }
        // The executing marker must be durable before the tool runs
        let marked = match self.state.get(task_id) {
            Some(task) => self.store.save_task(task),
            None => Ok(()),
        };
        if let Err(e) = marked {
            if let Some(slot) = self.state.get_mut(task_id) {
                *slot = before;
            }
            log::error!("Failed to mark task {} executing: {}", task_id, e);
            return TickOutcome::StoreUnavailable(e.to_string());
        }

        let session = self.session_mode(task_id);
        let Some(task) = self.state.get(task_id) else {
            return TickOutcome::Idle(IdleReason::Empty);
        };
        tracing::info!(
            task_id = %task_id,
            attempt = task.attempt(),
            priority = task.priority,
            "Executing task"
        );
        let request = RunRequest {
            content: task.content.clone(),
            working_directory: task.working_directory.clone(),
            context_files: task.context_files.clone(),
            session: session.clone(),
            timeout: self.config.timeout,
        };

        let output = self.runner.run(request).await;
        let finished = Local::now();
        if output.timed_out {
            let timeout_secs = self.config.timeout.as_secs();
            tracing::warn!(task_id = %task_id, timeout_secs = timeout_secs, "Execution timed out");
            if let Some(task) = self.state.get_mut(task_id) {
                task.add_log_at(finished, &format!("Process killed after the {}s timeout", timeout_secs));
            }
        }
        let result = self.classify(&output, finished);

        let status = match self.state.apply_result(task_id, &result, finished) {
            Ok(status) => status,
            Err(e) => {
                log::error!("Cannot record result for task {}: {}", task_id, e);
                return TickOutcome::StoreUnavailable(e.to_string());
            }
        };

        if let (SessionMode::Start(session_id), true) = (&session, result.success) {
            self.open_session(task_id, session_id);
        }
        if status == TaskStatus::Completed {
            self.record_completion(task_id, &result, finished);
        }
        self.trace_transition(task_id, status, &result);

        let persisted = self.persist();
        TickOutcome::Executed {
            task_id: task_id.to_string(),
            status,
            persisted,
        }
    }

    /// Decide how the run relates to a session, resolving placeholders
    fn session_mode(&mut self, task_id: &str) -> SessionMode {
        let Some(task) = self.state.get(task_id) else {
            return SessionMode::None;
        };
        if task.is_session_start {
            return SessionMode::Start(generate_session_id());
        }
        let Some(session_id) = task.session_id.clone() else {
            return SessionMode::None;
        };
        if !is_placeholder_session(&session_id) {
            return SessionMode::Resume(session_id);
        }

        // Opener is gone; the session may still have been recorded
        let name = task
            .chat_name
            .clone()
            .or_else(|| chat_name_from_placeholder(&session_id).map(str::to_string));
        let resolved = match name.as_deref().map(|n| self.sessions.resolve(n)) {
            Some(Ok(found)) => found,
            Some(Err(e)) => {
                log::warn!("Session lookup for task {} failed: {}", task_id, e);
                None
            }
            None => None,
        };

        match resolved {
            Some(real) => {
                self.state.rewrite_session(&session_id, &real);
                SessionMode::Resume(real)
            }
            None => {
                log::warn!("Task {} references unopened session {}", task_id, session_id);
                if let Some(task) = self.state.get_mut(task_id) {
                    task.add_log(&format!("Session {} was never opened; running without a session", session_id));
                }
                SessionMode::None
            }
        }
    }

    fn classify(&self, output: &RunOutput, now: DateTime<Local>) -> ExecutionResult {
        let rate_limit = self.detector.detect(&output.combined(), now);
        let error = if !output.success && output.stderr.trim().is_empty() {
            "Process exited with a non-zero status".to_string()
        } else {
            output.stderr.clone()
        };
        ExecutionResult {
            success: output.success && rate_limit.is_none(),
            output: output.stdout.clone(),
            error,
            rate_limit,
            elapsed: output.elapsed,
        }
    }

    /// Bind a successful opener's real session id and fan it out
    fn open_session(&mut self, task_id: &str, session_id: &str) {
        let Some(task) = self.state.get_mut(task_id) else {
            return;
        };
        task.is_session_start = false;
        let placeholder = task.session_id.replace(session_id.to_string());
        let chat_name = task.chat_name.clone().or_else(|| {
            placeholder
                .as_deref()
                .and_then(chat_name_from_placeholder)
                .map(str::to_string)
        });
        task.chat_name = chat_name.clone();
        task.add_log(&format!("Opened session {}", session_id));
        let working_directory = task.working_directory.clone();

        let rewritten = match placeholder {
            Some(placeholder) if placeholder != session_id => {
                self.state.rewrite_session(&placeholder, session_id)
            }
            _ => 0,
        };
        tracing::info!(
            task_id = %task_id,
            session_id = %session_id,
            rewritten = rewritten,
            "Session opened"
        );

        if let Some(name) = chat_name
            && let Err(e) = self.sessions.record(&name, session_id, &working_directory)
        {
            log::error!("Failed to record chat '{}' -> {}: {}", name, session_id, e);
        }
    }

    /// Session bookkeeping for a completed task
    fn record_completion(&self, task_id: &str, result: &ExecutionResult, now: DateTime<Local>) {
        let Some(task) = self.state.get(task_id) else {
            return;
        };
        let Some(session_id) = task.session_id.as_deref().filter(|s| !is_placeholder_session(s)) else {
            return;
        };

        if let Some(name) = task.chat_name.as_deref()
            && let Err(e) = self.sessions.touch(name)
        {
            log::warn!("Failed to update chat '{}': {}", name, e);
        }

        if let Some(dir) = &self.transcripts_dir {
            let entry = TranscriptEntry {
                session_id,
                chat_name: task.chat_name.as_deref(),
                working_directory: &task.working_directory,
                executed_at: task.last_executed.unwrap_or(now),
                prompt: &task.content,
                response: &result.output,
            };
            if let Err(e) = append_transcript(dir, &entry) {
                log::warn!("Failed to append transcript for task {}: {}", task_id, e);
            }
        }
    }

    fn trace_transition(&self, task_id: &str, status: TaskStatus, result: &ExecutionResult) {
        let retry_count = self.state.get(task_id).map(|t| t.retry_count).unwrap_or_default();
        match status {
            TaskStatus::Completed => tracing::info!(
                task_id = %task_id,
                elapsed_secs = result.elapsed.as_secs_f64(),
                "Task completed"
            ),
            TaskStatus::RateLimited => {
                let resume_at = self
                    .state
                    .get(task_id)
                    .and_then(|t| self.scheduler.policy().resume_at(t, self.config.cooldown));
                tracing::warn!(
                    task_id = %task_id,
                    retry_count = retry_count,
                    resume_at = ?resume_at,
                    "Task rate limited"
                );
            }
            TaskStatus::Queued => tracing::warn!(
                task_id = %task_id,
                retry_count = retry_count,
                error = %result.error.trim(),
                "Task failed, will retry"
            ),
            TaskStatus::Failed => tracing::error!(
                task_id = %task_id,
                retry_count = retry_count,
                "Task failed permanently"
            ),
            TaskStatus::Executing | TaskStatus::Cancelled => {}
        }
    }
}

fn log_outcome(outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Executed {
            task_id,
            status,
            persisted: false,
        } => log::warn!("Task {} -> {} (not yet persisted)", task_id, status),
        TickOutcome::Executed { task_id, status, .. } => log::info!("Task {} -> {}", task_id, status),
        TickOutcome::Idle(_) => {}
        TickOutcome::StoreUnavailable(e) => log::warn!("Tick skipped: {}", e),
    }
}
