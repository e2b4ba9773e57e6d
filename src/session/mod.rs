//! Chat sessions: human names mapped to the external tool's session ids.
//!
//! The scheduler only calls through `SessionDirectory`; it does not own the
//! storage behind it.

mod sqlite;
mod transcript;

pub use sqlite::SqliteSessionDirectory;
pub use transcript::{TranscriptEntry, append_transcript};

use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// One named chat
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatSession {
    pub chat_name: String,
    pub session_id: String,
    pub working_directory: PathBuf,
    pub created_at: DateTime<Local>,
    pub last_used: DateTime<Local>,
    pub total_prompts: u64,
}

/// Name -> session id lookup
pub trait SessionDirectory: Send + Sync {
    /// Session id recorded under `name`
    fn resolve(&self, name: &str) -> Result<Option<String>>;

    /// Record (or re-point) `name` at a session
    fn record(&self, name: &str, session_id: &str, working_directory: &Path) -> Result<()>;

    /// Bump last-used time and prompt count
    fn touch(&self, name: &str) -> Result<()>;

    /// All chats, most recently used first
    fn list(&self) -> Result<Vec<ChatSession>>;

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.resolve(name)?.is_some())
    }
}
