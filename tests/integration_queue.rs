//! Queue manager integration tests
//!
//! Drives `QueueManager` end to end over a real markdown store and session
//! database, with a scripted runner standing in for the external tool.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use promptq::detect::RateLimitDetector;
use promptq::domain::{QueueState, Task, TaskStatus};
use promptq::error::{QueueError, Result};
use promptq::runner::{RunOutput, RunRequest, Runner, SessionMode};
use promptq::scheduler::{IdleReason, ManagerConfig, QueueManager, SHUTDOWN_NOTE, STALE_EXECUTION_NOTE, TickOutcome};
use promptq::session::SqliteSessionDirectory;
use promptq::store::{MarkdownStore, QueueStore};

/// Replays canned outputs in order and records every request
#[derive(Default)]
struct ScriptedRunner {
    outputs: Mutex<VecDeque<RunOutput>>,
    requests: Mutex<Vec<RunRequest>>,
    /// Never return from `run`
    hang: bool,
}

impl ScriptedRunner {
    fn new(outputs: Vec<RunOutput>) -> Arc<Self> {
        Arc::new(Self {
            outputs: Mutex::new(outputs.into()),
            ..Default::default()
        })
    }

    fn hanging() -> Arc<Self> {
        Arc::new(Self {
            hang: true,
            ..Default::default()
        })
    }

    fn requests(&self) -> Vec<RunRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn run(&self, request: RunRequest) -> RunOutput {
        self.requests.lock().unwrap().push(request);
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.outputs.lock().unwrap().pop_front().unwrap_or_else(|| ok("done"))
    }

    async fn check_available(&self) -> Result<String> {
        Ok("scripted runner".to_string())
    }
}

fn ok(stdout: &str) -> RunOutput {
    RunOutput {
        success: true,
        stdout: stdout.to_string(),
        elapsed: Duration::from_millis(5),
        ..Default::default()
    }
}

fn fail(stderr: &str) -> RunOutput {
    RunOutput {
        success: false,
        stderr: stderr.to_string(),
        elapsed: Duration::from_millis(5),
        ..Default::default()
    }
}

/// Markdown store whose writes can be made to fail a set number of times
struct FlakyStore {
    inner: MarkdownStore,
    save_state_failures: Arc<AtomicUsize>,
    save_task_failures: Arc<AtomicUsize>,
}

impl FlakyStore {
    fn open(root: &Path) -> Self {
        Self {
            inner: MarkdownStore::open(root).unwrap(),
            save_state_failures: Arc::new(AtomicUsize::new(0)),
            save_task_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn should_fail(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl QueueStore for FlakyStore {
    fn load_state(&self) -> Result<QueueState> {
        self.inner.load_state()
    }

    fn save_state(&self, state: &QueueState) -> Result<()> {
        if Self::should_fail(&self.save_state_failures) {
            return Err(QueueError::Storage("disk full".to_string()));
        }
        self.inner.save_state(state)
    }

    fn save_task(&self, task: &Task) -> Result<()> {
        if Self::should_fail(&self.save_task_failures) {
            return Err(QueueError::Storage("disk full".to_string()));
        }
        self.inner.save_task(task)
    }

    fn load_archived(&self) -> Result<Vec<Task>> {
        self.inner.load_archived()
    }
}

fn manager_with_store(
    root: &Path,
    store: Box<dyn QueueStore>,
    runner: Arc<ScriptedRunner>,
    config: ManagerConfig,
) -> QueueManager {
    let sessions = SqliteSessionDirectory::open(root.join("sessions.db")).unwrap();
    QueueManager::new(config, store, runner, Arc::new(sessions), RateLimitDetector::default())
        .with_transcripts(root.join("chats"))
}

fn manager(root: &Path, runner: Arc<ScriptedRunner>, config: ManagerConfig) -> QueueManager {
    let store = MarkdownStore::open(root).unwrap();
    manager_with_store(root, Box::new(store), runner, config)
}

fn files_in(dir: PathBuf) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
        .collect();
    files.sort();
    files
}

/// Lower priority value is executed first regardless of insertion order
#[tokio::test]
async fn test_priority_order() {
    let temp = TempDir::new().unwrap();
    let runner = ScriptedRunner::new(vec![]);
    let mut manager = manager(temp.path(), runner.clone(), ManagerConfig::default());

    manager.submit(Task::new("B", ".").with_priority(5)).unwrap();
    manager.submit(Task::new("A", ".").with_priority(0)).unwrap();

    manager.tick().await;
    manager.tick().await;
    assert_eq!(manager.tick().await, TickOutcome::Idle(IdleReason::Empty));

    let order: Vec<String> = runner.requests().into_iter().map(|r| r.content).collect();
    assert_eq!(order, vec!["A", "B"]);
}

/// Epoch-stamped limit message parks the task until the reported reset
#[tokio::test]
async fn test_rate_limit_with_epoch_reset() {
    let temp = TempDir::new().unwrap();
    let runner = ScriptedRunner::new(vec![ok("Claude AI usage limit reached|1712000000")]);
    let mut manager = manager(temp.path(), runner, ManagerConfig::default());
    let id = manager.submit(Task::new("work", ".")).unwrap();

    manager.tick().await;

    let store = MarkdownStore::open(temp.path()).unwrap();
    let task = store.find_task(&id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::RateLimited);
    assert_eq!(task.reset_time.unwrap().timestamp(), 1_712_000_000);
    assert!(task.rate_limited_at.is_some());
    assert!(task.execution_log.contains("RATE LIMITED"));
    assert_eq!(store.load_state().unwrap().counters.rate_limited_count, 1);
}

/// max_retries=2 allows three attempts, then the task fails for good
#[tokio::test]
async fn test_retry_budget_exhausted() {
    let temp = TempDir::new().unwrap();
    let runner = ScriptedRunner::new(vec![fail("boom 1"), fail("boom 2"), fail("boom 3"), ok("never")]);
    let mut manager = manager(temp.path(), runner.clone(), ManagerConfig::default());
    let id = manager.submit(Task::new("flaky", ".").with_max_retries(2)).unwrap();

    let mut statuses = Vec::new();
    for _ in 0..4 {
        if let TickOutcome::Executed { status, .. } = manager.tick().await {
            statuses.push(status);
        }
    }
    assert_eq!(statuses, vec![TaskStatus::Queued, TaskStatus::Queued, TaskStatus::Failed]);
    assert_eq!(runner.requests().len(), 3);

    let task = manager.find_task(&id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert!(task.execution_log.contains("boom 3"));
    assert_eq!(files_in(temp.path().join("failed")).len(), 1);
    assert_eq!(manager.status().unwrap().failed_count, 1);
}

/// Placeholder session ids are replaced on every follower once the opener succeeds
#[tokio::test]
async fn test_session_fan_out() {
    let temp = TempDir::new().unwrap();
    let runner = ScriptedRunner::new(vec![ok("opened"), ok("one"), ok("two")]);
    let mut manager = manager(temp.path(), runner.clone(), ManagerConfig::default());

    let opener = manager.create_chat("backend", "Start", Path::new(".")).unwrap();
    let placeholder = manager.find_session("backend").unwrap().unwrap();
    assert_eq!(opener.session_id.as_deref(), Some(placeholder.as_str()));

    let f1 = manager
        .submit(Task::new("Follow 1", ".").with_session(placeholder.as_str(), Some("backend".to_string())))
        .unwrap();
    let f2 = manager
        .submit(Task::new("Follow 2", ".").with_session(placeholder.as_str(), Some("backend".to_string())))
        .unwrap();

    manager.tick().await;
    let real = match &runner.requests()[0].session {
        SessionMode::Start(id) => id.clone(),
        other => panic!("expected session start, got {:?}", other),
    };

    let store = MarkdownStore::open(temp.path()).unwrap();
    for id in [&f1, &f2] {
        let task = store.find_task(id).unwrap().unwrap();
        assert_eq!(task.session_id.as_deref(), Some(real.as_str()));
    }
    assert_eq!(manager.find_session("backend").unwrap().as_deref(), Some(real.as_str()));

    manager.tick().await;
    manager.tick().await;
    let requests = runner.requests();
    assert_eq!(requests[1].session, SessionMode::Resume(real.clone()));
    assert_eq!(requests[2].session, SessionMode::Resume(real.clone()));

    let transcript = fs::read_to_string(temp.path().join("chats").join(format!("{}.md", real))).unwrap();
    assert!(transcript.contains("total_prompts: 3"));
    assert_eq!(manager.chats().unwrap()[0].total_prompts, 3);
}

/// Graceful shutdown puts an executing task back in the queue with a note
#[tokio::test]
async fn test_shutdown_requeues_executing() {
    let temp = TempDir::new().unwrap();
    let runner = ScriptedRunner::hanging();
    let mut manager = manager(temp.path(), runner.clone(), ManagerConfig::default());
    let id = manager.submit(Task::new("long job", ".")).unwrap();

    manager
        .run(tokio::time::sleep(Duration::from_millis(200)))
        .await
        .unwrap();
    assert_eq!(runner.requests().len(), 1);

    let store = MarkdownStore::open(temp.path()).unwrap();
    let task = store.find_task(&id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.retry_count, 0);
    assert!(task.execution_log.contains(SHUTDOWN_NOTE));
    assert!(files_in(temp.path().join("queue")).iter().all(|p| {
        !p.to_string_lossy().ends_with(".executing.md")
    }));
}

/// An executing record left by a crashed process is requeued on the next load
#[tokio::test]
async fn test_stale_executing_recovered_on_startup() {
    let temp = TempDir::new().unwrap();
    let store = MarkdownStore::open(temp.path()).unwrap();
    let mut task = Task::new("interrupted", ".");
    task.begin_execution(chrono::Local::now()).unwrap();
    store.save_task(&task).unwrap();

    let mut manager = manager(temp.path(), ScriptedRunner::new(vec![]), ManagerConfig::default());
    manager.startup().await.unwrap();

    let recovered = manager.state().get(&task.id).unwrap();
    assert_eq!(recovered.status, TaskStatus::Queued);
    assert_eq!(recovered.retry_count, 0);
    assert!(recovered.execution_log.contains(STALE_EXECUTION_NOTE));
}

/// Hitting the limit again on the same task does not bump the aggregate count
#[tokio::test]
async fn test_repeat_rate_limit_counted_once() {
    let temp = TempDir::new().unwrap();
    let limit = "Error: rate limit exceeded, try again later";
    let runner = ScriptedRunner::new(vec![ok(limit), ok(limit), ok("finally")]);
    let config = ManagerConfig::default().with_cooldown(chrono::Duration::zero());
    let mut manager = manager(temp.path(), runner.clone(), config);
    let id = manager.submit(Task::new("quota hungry", ".")).unwrap();

    for _ in 0..3 {
        manager.tick().await;
    }

    let task = manager.find_task(&id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 2);
    let stats = manager.status().unwrap();
    assert_eq!(stats.rate_limited_count, 1);
    assert_eq!(stats.total_processed, 1);
}

/// Terminal records are never rewritten by later loads or ticks
#[tokio::test]
async fn test_terminal_records_untouched() {
    let temp = TempDir::new().unwrap();
    let mut first = manager(temp.path(), ScriptedRunner::new(vec![ok("done")]), ManagerConfig::default());
    first.submit(Task::new("finish me", ".")).unwrap();
    first.tick().await;

    let completed = files_in(temp.path().join("completed"));
    assert_eq!(completed.len(), 1);
    let before = fs::read(&completed[0]).unwrap();

    let mut second = manager(temp.path(), ScriptedRunner::new(vec![ok("other")]), ManagerConfig::default());
    second.startup().await.unwrap();
    second.submit(Task::new("another", ".")).unwrap();
    second.tick().await;
    second.shutdown().unwrap();

    assert_eq!(fs::read(&completed[0]).unwrap(), before);
    assert_eq!(second.status().unwrap().total_processed, 2);
}

/// A failed save after execution is written back on the next tick without rerunning the task
#[tokio::test]
async fn test_failed_save_written_back_next_tick() {
    let temp = TempDir::new().unwrap();
    let store = FlakyStore::open(temp.path());
    let save_state_failures = store.save_state_failures.clone();
    let runner = ScriptedRunner::new(vec![ok("done")]);
    let mut manager = manager_with_store(temp.path(), Box::new(store), runner.clone(), ManagerConfig::default());
    let id = manager.submit(Task::new("important", ".")).unwrap();

    save_state_failures.store(1, Ordering::SeqCst);
    let outcome = manager.tick().await;
    assert_eq!(
        outcome,
        TickOutcome::Executed {
            task_id: id.clone(),
            status: TaskStatus::Completed,
            persisted: false,
        }
    );
    let on_disk = MarkdownStore::open(temp.path()).unwrap();
    assert_eq!(on_disk.find_task(&id).unwrap().unwrap().status, TaskStatus::Executing);
    assert!(files_in(temp.path().join("queue"))
        .iter()
        .any(|p| p.to_string_lossy().ends_with(".executing.md")));

    assert_eq!(manager.tick().await, TickOutcome::Idle(IdleReason::Empty));
    assert_eq!(runner.requests().len(), 1);

    let task = on_disk.find_task(&id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(!task.execution_log.contains(STALE_EXECUTION_NOTE));
    assert!(files_in(temp.path().join("queue")).is_empty());
    assert_eq!(on_disk.load_state().unwrap().counters.total_processed, 1);
}

/// If the executing marker cannot be written the task is restored and not run
#[tokio::test]
async fn test_failed_executing_marker_skips_run() {
    let temp = TempDir::new().unwrap();
    let store = FlakyStore::open(temp.path());
    let save_task_failures = store.save_task_failures.clone();
    let runner = ScriptedRunner::new(vec![ok("done")]);
    let mut manager = manager_with_store(temp.path(), Box::new(store), runner.clone(), ManagerConfig::default());
    let id = manager.submit(Task::new("careful", ".")).unwrap();

    save_task_failures.store(1, Ordering::SeqCst);
    let outcome = manager.tick().await;
    assert!(matches!(outcome, TickOutcome::StoreUnavailable(_)));
    assert!(runner.requests().is_empty());

    let task = manager.state().get(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.retry_count, 0);
    assert!(task.execution_log.is_empty());
    let on_disk = MarkdownStore::open(temp.path()).unwrap();
    assert_eq!(on_disk.find_task(&id).unwrap().unwrap().status, TaskStatus::Queued);

    assert!(matches!(
        manager.tick().await,
        TickOutcome::Executed { status: TaskStatus::Completed, persisted: true, .. }
    ));
    assert_eq!(runner.requests().len(), 1);
}
