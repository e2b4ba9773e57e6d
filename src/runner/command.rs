use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

use super::{RunOutput, RunRequest, Runner, SessionMode};
use crate::config::RunnerConfig;
use crate::error::{QueueError, Result};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs prompts through an external command-line tool
#[derive(Debug, Clone)]
pub struct CommandRunner {
    config: RunnerConfig,
}

impl CommandRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Get the command
    pub fn command(&self) -> &str {
        &self.config.command
    }

    /// Prompt text with existing context files prefixed as `@path` references
    fn full_prompt(request: &RunRequest) -> String {
        let refs: Vec<String> = request
            .context_files
            .iter()
            .filter(|file| request.working_directory.join(file).exists())
            .map(|file| format!("@{}", file))
            .collect();

        if refs.is_empty() {
            request.content.clone()
        } else {
            format!("{} {}", refs.join(" "), request.content)
        }
    }

    fn build_command(&self, request: &RunRequest) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        match &request.session {
            SessionMode::None => {}
            SessionMode::Resume(id) => {
                cmd.arg("--resume").arg(id);
            }
            SessionMode::Start(id) => {
                cmd.arg("--session-id").arg(id);
            }
        }
        cmd.arg(Self::full_prompt(request));
        cmd.current_dir(&request.working_directory);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn ensure_dir(dir: &Path) -> std::io::Result<()> {
        if !dir.exists() {
            log::info!("Creating missing working directory {}", dir.display());
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Runner for CommandRunner {
    async fn run(&self, request: RunRequest) -> RunOutput {
        let start = Instant::now();
        let failed = |message: String, timed_out: bool| RunOutput {
            success: false,
            stdout: String::new(),
            stderr: message,
            elapsed: start.elapsed(),
            timed_out,
        };

        if let Err(e) = Self::ensure_dir(&request.working_directory) {
            return failed(
                format!(
                    "Execution failed: cannot create {}: {}",
                    request.working_directory.display(),
                    e
                ),
                false,
            );
        }

        let child = match self.build_command(&request).spawn() {
            Ok(child) => child,
            Err(e) => {
                return failed(
                    format!("Execution failed: cannot start '{}': {}", self.config.command, e),
                    false,
                );
            }
        };

        // Dropping the future on timeout kills the child
        match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => RunOutput {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                elapsed: start.elapsed(),
                timed_out: false,
            },
            Ok(Err(e)) => failed(format!("Execution failed: {}", e), false),
            Err(_) => failed(
                format!("Execution timed out after {} seconds", request.timeout.as_secs()),
                true,
            ),
        }
    }

    async fn check_available(&self) -> Result<String> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.check_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            QueueError::Runner(format!(
                "'{}' not found or not executable: {}",
                self.config.command, e
            ))
        })?;

        match tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => {
                Ok(format!("'{}' is available", self.config.command))
            }
            Ok(Ok(output)) => Err(QueueError::Runner(format!(
                "'{}' exited with {:?}: {}",
                self.config.command,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            Ok(Err(e)) => Err(QueueError::Runner(e.to_string())),
            Err(_) => Err(QueueError::Runner(format!(
                "'{}' did not respond within {} seconds",
                self.config.command,
                PROBE_TIMEOUT.as_secs()
            ))),
        }
    }
}
