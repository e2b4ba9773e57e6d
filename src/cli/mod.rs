//! CLI module for promptq - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for running the queue,
//! adding and inspecting prompts, and managing chat sessions.

pub mod commands;

pub use commands::Cli;
