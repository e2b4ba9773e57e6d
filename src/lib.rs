//! promptq - a durable prompt queue for a quota-limited CLI tool
//!
//! Prompts are persisted as markdown records, run one at a time in priority
//! order, and parked when the tool reports its usage limit until the quota
//! resets.

pub mod config;
pub mod detect;
pub mod domain;
pub mod error;
pub mod id;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod store;

pub use error::{QueueError, Result};
