//! Execution outcome types
//!
//! An `ExecutionResult` is what the state machine consumes after one run of the
//! external tool: the raw runner output plus the rate-limit classification.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Classification of one run's output with respect to quota exhaustion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    /// When the quota is expected to be available again
    pub reset_time: Option<DateTime<Local>>,
    /// The phrase that triggered detection
    pub matched_phrase: String,
    /// Output excerpt kept for the audit log (bounded length)
    pub message: String,
    /// When the limit was observed
    pub detected_at: DateTime<Local>,
}

/// Result of executing a task once
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Tool exited successfully and was not rate limited
    pub success: bool,
    /// Captured standard output
    pub output: String,
    /// Captured standard error or a diagnostic (timeout, spawn failure, ...)
    pub error: String,
    /// Present when the output was classified as quota exhaustion
    pub rate_limit: Option<RateLimitInfo>,
    /// Wall time spent in the runner
    pub elapsed: Duration,
}

impl ExecutionResult {
    /// Successful run
    pub fn success(output: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: String::new(),
            rate_limit: None,
            elapsed,
        }
    }

    /// Failed run (non-quota reason)
    pub fn failure(error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
            rate_limit: None,
            elapsed,
        }
    }

    /// Run refused because of quota exhaustion
    pub fn rate_limited(info: RateLimitInfo, elapsed: Duration) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: String::new(),
            rate_limit: Some(info),
            elapsed,
        }
    }

    /// True if the run was classified as rate limited
    pub fn is_rate_limited(&self) -> bool {
        self.rate_limit.is_some()
    }

    /// One-line summary used in task logs
    pub fn summary(&self) -> String {
        format!("Execution completed in {:.1}s", self.elapsed.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_is_not_rate_limited() {
        let result = ExecutionResult::success("done", Duration::from_secs(2));
        assert!(result.success);
        assert!(!result.is_rate_limited());
        assert_eq!(result.output, "done");
    }

    #[test]
    fn test_rate_limited_is_not_success() {
        let info = RateLimitInfo {
            reset_time: None,
            matched_phrase: "quota exceeded".to_string(),
            message: "quota exceeded".to_string(),
            detected_at: Local::now(),
        };
        let result = ExecutionResult::rate_limited(info, Duration::ZERO);
        assert!(!result.success);
        assert!(result.is_rate_limited());
    }

    #[test]
    fn test_summary_formats_elapsed_seconds() {
        let result = ExecutionResult::failure("boom", Duration::from_millis(1500));
        assert_eq!(result.summary(), "Execution completed in 1.5s");
    }
}
