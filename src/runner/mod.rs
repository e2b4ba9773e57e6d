//! External tool invocation.
//!
//! The scheduler never spawns processes itself. It hands a `RunRequest` to a
//! `Runner` and gets raw output back; classification happens afterwards.

mod command;

pub use command::CommandRunner;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// How a run relates to a conversation session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionMode {
    #[default]
    None,
    /// Continue an existing session
    Resume(String),
    /// Open a new session under this id
    Start(String),
}

/// One invocation of the external tool
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub content: String,
    pub working_directory: PathBuf,
    pub context_files: Vec<String>,
    pub session: SessionMode,
    pub timeout: Duration,
}

/// Raw result of one invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    /// Process exited with status zero
    pub success: bool,
    pub stdout: String,
    /// Standard error, or a diagnostic when the process never ran
    pub stderr: String,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl RunOutput {
    /// Combined text fed to the rate-limit detector
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Something that can execute a prompt
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run one prompt. Spawn failures and timeouts are reported in the
    /// output, not as errors.
    async fn run(&self, request: RunRequest) -> RunOutput;

    /// Check the tool is reachable; returns a short description on success
    async fn check_available(&self) -> Result<String>;
}
