//! Durable storage for the queue.
//!
//! The store is the only component that reads or writes persisted records.
//! The scheduler talks to it through `QueueStore`, so the directory layout in
//! `MarkdownStore` can be swapped for another backend without touching the
//! task model.
//!
//! # Example
//!
//! ```ignore
//! use promptq::store::{MarkdownStore, QueueStore};
//!
//! let store = MarkdownStore::open("~/.promptq")?;
//! let mut state = store.load_state()?;
//! state.add_task(Task::new("Fix the flaky test", "."))?;
//! store.save_state(&state)?;
//! ```

mod markdown;
pub mod record;

pub use markdown::MarkdownStore;

use crate::domain::{QueueState, Task, TaskStatus};
use crate::error::Result;

/// Lifecycle bucket a record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    /// Queued, executing and rate-limited tasks
    Active,
    Completed,
    /// Failed and cancelled tasks
    Failed,
}

impl Bucket {
    pub fn for_status(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Queued | TaskStatus::Executing | TaskStatus::RateLimited => Bucket::Active,
            TaskStatus::Completed => Bucket::Completed,
            TaskStatus::Failed | TaskStatus::Cancelled => Bucket::Failed,
        }
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            Bucket::Active => "queue",
            Bucket::Completed => "completed",
            Bucket::Failed => "failed",
        }
    }
}

/// Persistence backend for the queue
pub trait QueueStore: Send {
    /// Load the active tasks and the aggregate counters
    fn load_state(&self) -> Result<QueueState>;

    /// Persist every task in the state plus the counters
    fn save_state(&self, state: &QueueState) -> Result<()>;

    /// Persist a single task
    fn save_task(&self, task: &Task) -> Result<()>;

    /// Load terminal tasks (completed, failed, cancelled)
    fn load_archived(&self) -> Result<Vec<Task>>;

    /// Find a task anywhere in the store
    fn find_task(&self, id: &str) -> Result<Option<Task>> {
        if let Some(task) = self.load_state()?.tasks.into_iter().find(|t| t.id == id) {
            return Ok(Some(task));
        }
        Ok(self.load_archived()?.into_iter().find(|t| t.id == id))
    }
}
