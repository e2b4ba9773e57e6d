//! Domain types for promptq
//!
//! - Task: one queued prompt and its lifecycle state machine
//! - QueueState: the task set plus monotonic aggregate counters
//! - ExecutionResult: what one run of the external tool produced

pub mod outcome;
pub mod state;
pub mod task;

pub use outcome::{ExecutionResult, RateLimitInfo};
pub use state::{QueueCounters, QueueState, QueueStats};
pub use task::{DEFAULT_MAX_RETRIES, Task, TaskStatus};
