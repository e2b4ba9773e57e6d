use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::QueueError;
use crate::scheduler::BackoffPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub storage_dir: PathBuf,
    pub log_level: Option<String>,
    pub runner: RunnerConfig,
    pub scheduler: SchedulerConfig,
    pub rate_limit: RateLimitConfig,
    pub defaults: TaskDefaults,
}

/// External tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RunnerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub check_args: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            timeout_secs: 3600,
            check_args: vec!["--help".to_string()],
        }
    }
}

impl RunnerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerConfig {
    pub check_interval_secs: u64,
    pub cooldown_secs: u64,
    pub backoff: BackoffPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            cooldown_secs: 300,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }
}

/// Rate-limit detection tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RateLimitConfig {
    /// Hours of day at which the tool's quota window rolls over
    pub window_hours: Vec<u32>,
    /// Added to the latest timestamp found in a limit message
    pub grace_hours: i64,
    /// Characters of output kept in the task log
    pub message_limit: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_hours: vec![0, 5, 10, 15, 20],
            grace_hours: 5,
            message_limit: 500,
        }
    }
}

/// Defaults applied to newly submitted tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TaskDefaults {
    pub priority: i64,
    pub max_retries: u32,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            priority: 0,
            max_retries: crate::domain::DEFAULT_MAX_RETRIES,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("~/.promptq"),
            log_level: Some("info".to_string()),
            runner: RunnerConfig::default(),
            scheduler: SchedulerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            defaults: TaskDefaults::default(),
        }
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_name = env!("CARGO_PKG_NAME");

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.runner.command.trim().is_empty() {
            return Err(QueueError::Config("runner.command must not be empty".to_string()));
        }
        if self.runner.timeout_secs == 0 {
            return Err(QueueError::Config("runner.timeout-secs must be positive".to_string()));
        }
        if self.scheduler.check_interval_secs == 0 {
            return Err(QueueError::Config(
                "scheduler.check-interval-secs must be positive".to_string(),
            ));
        }
        if let Some(hour) = self.rate_limit.window_hours.iter().find(|h| **h > 23) {
            return Err(QueueError::Config(format!(
                "rate-limit.window-hours contains {}, expected 0..=23",
                hour
            )));
        }
        Ok(())
    }

    /// Storage root with `~` expanded
    pub fn storage_root(&self) -> PathBuf {
        expand_home(&self.storage_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.runner.command, "claude");
        assert_eq!(config.runner.timeout_secs, 3600);
        assert_eq!(config.scheduler.check_interval_secs, 30);
        assert_eq!(config.scheduler.cooldown_secs, 300);
        assert_eq!(config.scheduler.backoff, BackoffPolicy::FixedCooldown);
        assert_eq!(config.rate_limit.window_hours, vec![0, 5, 10, 15, 20]);
        assert_eq!(config.defaults.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_explicit_partial_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("promptq.yml");
        fs::write(
            &path,
            "storage-dir: /tmp/q\nscheduler:\n  check-interval-secs: 5\n  backoff: reported-reset\nrunner:\n  command: my-tool\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.storage_dir, PathBuf::from("/tmp/q"));
        assert_eq!(config.scheduler.check_interval_secs, 5);
        assert_eq!(config.scheduler.cooldown_secs, 300);
        assert_eq!(config.scheduler.backoff, BackoffPolicy::ReportedReset);
        assert_eq!(config.runner.command, "my-tool");
        assert_eq!(config.runner.check_args, vec!["--help"]);
    }

    #[test]
    fn test_load_explicit_missing_file_is_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nope.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_load_explicit_invalid_values_is_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("promptq.yml");
        fs::write(&path, "rate-limit:\n  window-hours: [0, 25]\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.scheduler.check_interval_secs = 0;
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let mut config = Config::default();
        config.runner.command = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_home(Path::new("~/.promptq")), home.join(".promptq"));
        assert_eq!(expand_home(Path::new("/srv/q")), PathBuf::from("/srv/q"));
    }
}
