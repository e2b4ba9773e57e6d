//! Directory-per-bucket markdown store.
//!
//! Layout under the storage root:
//!
//! ```text
//! queue/       active tasks: {id}-{slug}.md, .executing.md, .rate-limited.md
//! completed/   {id}-{slug}.md
//! failed/      {id}-{slug}.md, {id}-cancelled.md
//! chats/       per-session transcripts
//! queue-state.json   aggregate counters
//! ```
//!
//! Every write goes to a sibling `.tmp` file first and is renamed into place,
//! so a failed write leaves the previous record intact.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use super::record;
use super::{Bucket, QueueStore};
use crate::domain::{QueueCounters, QueueState, Task, TaskStatus};
use crate::error::{QueueError, Result};
use crate::id::generate_task_id;

const EXECUTING_SUFFIX: &str = ".executing.md";
const RATE_LIMITED_SUFFIX: &str = ".rate-limited.md";
const STATE_FILE: &str = "queue-state.json";

/// On-disk shape of the counters file
#[derive(Debug, Default, Serialize, Deserialize)]
struct CountersFile {
    #[serde(flatten)]
    counters: QueueCounters,
    #[serde(default)]
    updated_at: Option<DateTime<Local>>,
}

/// Markdown-file store rooted at one directory
#[derive(Debug, Clone)]
pub struct MarkdownStore {
    base_dir: PathBuf,
    queue_dir: PathBuf,
    completed_dir: PathBuf,
    failed_dir: PathBuf,
    chats_dir: PathBuf,
    state_file: PathBuf,
}

impl MarkdownStore {
    /// Open or create a store at the given root.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let store = Self {
            queue_dir: base_dir.join(Bucket::Active.dir_name()),
            completed_dir: base_dir.join(Bucket::Completed.dir_name()),
            failed_dir: base_dir.join(Bucket::Failed.dir_name()),
            chats_dir: base_dir.join("chats"),
            state_file: base_dir.join(STATE_FILE),
            base_dir,
        };

        for dir in [
            &store.queue_dir,
            &store.completed_dir,
            &store.failed_dir,
            &store.chats_dir,
        ] {
            fs::create_dir_all(dir).map_err(|e| {
                QueueError::Storage(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }

        log::debug!("Opened queue store at {}", store.base_dir.display());
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn queue_dir(&self) -> &Path {
        &self.queue_dir
    }

    pub fn chats_dir(&self) -> &Path {
        &self.chats_dir
    }

    fn dir(&self, bucket: Bucket) -> &Path {
        match bucket {
            Bucket::Active => &self.queue_dir,
            Bucket::Completed => &self.completed_dir,
            Bucket::Failed => &self.failed_dir,
        }
    }

    /// Filename for a task in its current status
    fn file_name(task: &Task) -> String {
        let base = record::base_name(task);
        match task.status {
            TaskStatus::Executing => format!("{}{}", base, EXECUTING_SUFFIX),
            TaskStatus::RateLimited => format!("{}{}", base, RATE_LIMITED_SUFFIX),
            TaskStatus::Cancelled => format!("{}-cancelled.md", task.id),
            _ => format!("{}.md", base),
        }
    }

    /// Status implied by an active-bucket filename
    fn status_from_file_name(name: &str) -> TaskStatus {
        if name.ends_with(EXECUTING_SUFFIX) {
            TaskStatus::Executing
        } else if name.ends_with(RATE_LIMITED_SUFFIX) {
            TaskStatus::RateLimited
        } else {
            TaskStatus::Queued
        }
    }

    /// All record files in a directory, sorted by name
    fn record_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let pattern = Path::new(&glob::Pattern::escape(&dir.to_string_lossy()))
            .join("*.md")
            .to_string_lossy()
            .into_owned();
        let paths = glob::glob(&pattern)
            .map_err(|e| QueueError::Storage(format!("Bad record pattern {}: {}", pattern, e)))?;

        let mut files = Vec::new();
        for entry in paths {
            match entry {
                Ok(path) if path.is_file() => files.push(path),
                Ok(_) => {}
                Err(e) => return Err(QueueError::Storage(e.to_string())),
            }
        }
        files.sort();
        Ok(files)
    }

    fn file_name_of(path: &Path) -> &str {
        path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
    }

    /// Record files in `dir` that belong to task `id`
    fn files_for_id(dir: &Path, id: &str) -> Result<Vec<PathBuf>> {
        Ok(Self::record_files(dir)?
            .into_iter()
            .filter(|p| record::id_from_file_name(Self::file_name_of(p)) == id)
            .collect())
    }

    fn read_record(path: &Path) -> Result<Task> {
        let text = fs::read_to_string(path)?;
        let name = Self::file_name_of(path);
        let fallback_created = fs::metadata(path)
            .and_then(|m| m.modified())
            .map(DateTime::<Local>::from)
            .unwrap_or_else(|_| Local::now());
        Ok(record::parse(&text, record::id_from_file_name(name), fallback_created))
    }

    fn write_atomic(path: &Path, contents: &str) -> Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, contents)
            .map_err(|e| QueueError::Storage(format!("Failed to write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            QueueError::Storage(format!("Failed to move record into {}: {}", path.display(), e))
        })
    }

    /// Ids with a terminal record in the archive buckets
    fn archived_ids(&self) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for dir in [&self.completed_dir, &self.failed_dir] {
            for path in Self::record_files(dir)? {
                ids.insert(record::id_from_file_name(Self::file_name_of(&path)).to_string());
            }
        }
        Ok(ids)
    }

    fn load_counters(&self) -> QueueCounters {
        if !self.state_file.exists() {
            return QueueCounters::default();
        }
        let parsed = fs::read_to_string(&self.state_file)
            .map_err(QueueError::from)
            .and_then(|text| serde_json::from_str::<CountersFile>(&text).map_err(QueueError::from));
        match parsed {
            Ok(file) => file.counters,
            Err(e) => {
                log::warn!("Ignoring unreadable {}: {}", self.state_file.display(), e);
                QueueCounters::default()
            }
        }
    }

    fn save_counters(&self, counters: &QueueCounters) -> Result<()> {
        let file = CountersFile {
            counters: *counters,
            updated_at: Some(Local::now()),
        };
        Self::write_atomic(&self.state_file, &serde_json::to_string_pretty(&file)?)
    }

    /// Write a hand-editable task skeleton into the active bucket.
    pub fn create_template(&self, name: &str, priority: i64, max_retries: u32) -> Result<PathBuf> {
        let slug = record::slugify(name);
        let id = generate_task_id();
        let file_name = if slug.is_empty() {
            format!("{}.md", id)
        } else {
            format!("{}-{}.md", id, slug)
        };
        let content = format!(
            "---\n\
             priority: {}\n\
             working_directory: .\n\
             context_files: []\n\
             max_retries: {}\n\
             estimated_tokens: null\n\
             ---\n\
             \n\
             # Prompt Title\n\
             \n\
             Write your prompt here...\n\
             \n\
             ## Context\n\
             Any additional context or requirements...\n\
             \n\
             ## Expected Output\n\
             What should be delivered...\n",
            priority, max_retries
        );
        let path = self.queue_dir.join(file_name);
        Self::write_atomic(&path, &content)?;
        Ok(path)
    }
}

impl QueueStore for MarkdownStore {
    fn load_state(&self) -> Result<QueueState> {
        let archived = self.archived_ids()?;
        let mut tasks: HashMap<String, Task> = HashMap::new();

        for path in Self::record_files(&self.queue_dir)? {
            let mut task = match Self::read_record(&path) {
                Ok(task) => task,
                Err(e) => {
                    log::warn!("Skipping unreadable record {}: {}", path.display(), e);
                    continue;
                }
            };
            task.status = Self::status_from_file_name(Self::file_name_of(&path));

            if archived.contains(&task.id) {
                log::warn!(
                    "Removing stale active record {} (task {} is already archived)",
                    path.display(),
                    task.id
                );
                fs::remove_file(&path)?;
                continue;
            }

            // A crash between writing a record and removing its predecessor
            // leaves two files; the log is append-only, so the longer one is newer.
            match tasks.get(&task.id) {
                Some(existing) if existing.execution_log.len() >= task.execution_log.len() => {}
                _ => {
                    tasks.insert(task.id.clone(), task);
                }
            }
        }

        let mut tasks: Vec<Task> = tasks.into_values().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        Ok(QueueState {
            tasks,
            counters: self.load_counters(),
        })
    }

    fn save_state(&self, state: &QueueState) -> Result<()> {
        for task in &state.tasks {
            self.save_task(task)?;
        }
        self.save_counters(&state.counters)
    }

    fn save_task(&self, task: &Task) -> Result<()> {
        let target = self
            .dir(Bucket::for_status(task.status))
            .join(Self::file_name(task));
        Self::write_atomic(&target, &record::render(task)?)?;

        for stale in Self::files_for_id(&self.queue_dir, &task.id)? {
            if stale != target {
                fs::remove_file(&stale).map_err(|e| {
                    QueueError::Storage(format!("Failed to remove {}: {}", stale.display(), e))
                })?;
            }
        }
        Ok(())
    }

    fn load_archived(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for dir in [&self.completed_dir, &self.failed_dir] {
            for path in Self::record_files(dir)? {
                match Self::read_record(&path) {
                    Ok(task) => tasks.push(task),
                    Err(e) => log::warn!("Skipping unreadable record {}: {}", path.display(), e),
                }
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }
}
