//! Error types for promptq
//!
//! Centralized error handling using thiserror. Failed or rate-limited runs of
//! the external tool are not errors here; they are execution results that the
//! task state machine consumes.

use thiserror::Error;

/// All error types that can occur in promptq
#[derive(Debug, Error)]
pub enum QueueError {
    /// Task not found in the queue or the archive
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Rejected user operation (cancel while executing, duplicate chat name, ...)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// External tool unavailable or misconfigured
    #[error("Runner error: {0}")]
    Runner(String),

    /// Session directory error
    #[error("Session error: {0}")]
    Session(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML front matter error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite error from the session directory
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type alias for promptq operations
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_not_found_error() {
        let err = QueueError::TaskNotFound("a1b2c3d4".to_string());
        assert_eq!(err.to_string(), "Task not found: a1b2c3d4");
    }

    #[test]
    fn test_invalid_operation_error() {
        let err = QueueError::InvalidOperation("cannot cancel executing task a1b2c3d4".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid operation: cannot cancel executing task a1b2c3d4"
        );
    }

    #[test]
    fn test_storage_error() {
        let err = QueueError::Storage("disk full".to_string());
        assert_eq!(err.to_string(), "Storage error: disk full");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: QueueError = io_err.into();
        assert!(matches!(err, QueueError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: QueueError = json_err.into();
        assert!(matches!(err, QueueError::Json(_)));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_err = serde_yaml::from_str::<u32>("[not, a, number]").unwrap_err();
        let err: QueueError = yaml_err.into();
        assert!(matches!(err, QueueError::Yaml(_)));
    }
}
