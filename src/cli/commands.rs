//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - start: run the queue until interrupted
//! - add/template: put prompts in the queue
//! - status/list/show: inspect the queue and archive
//! - cancel: remove a waiting prompt
//! - test: check the external tool responds
//! - chat: named sessions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use promptq::config::Config;

/// promptq - queue prompts and run them when the quota allows
#[derive(Parser, Debug)]
#[command(name = "promptq")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the storage directory
    #[arg(long, global = true)]
    pub storage_dir: Option<PathBuf>,

    /// Override the external tool command
    #[arg(long, global = true)]
    pub command: Option<String>,

    /// Override seconds between scheduler ticks
    #[arg(long, global = true)]
    pub check_interval: Option<u64>,

    /// Override the per-run timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Apply command-line overrides on top of the loaded config
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(dir) = &self.storage_dir {
            config.storage_dir = dir.clone();
        }
        if let Some(command) = &self.command {
            config.runner.command = command.clone();
        }
        if let Some(secs) = self.check_interval {
            config.scheduler.check_interval_secs = secs;
        }
        if let Some(secs) = self.timeout {
            config.runner.timeout_secs = secs;
        }
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the queue until interrupted
    Start,

    /// Add a prompt to the queue
    Add {
        /// Prompt text
        prompt: String,

        /// Priority (lower runs first)
        #[arg(short, long)]
        priority: Option<i64>,

        /// Working directory for the tool
        #[arg(short = 'd', long)]
        working_dir: Option<PathBuf>,

        /// Context files to reference
        #[arg(short = 'f', long, num_args = 1..)]
        context_files: Vec<String>,

        /// Retries after the first attempt
        #[arg(short = 'r', long)]
        max_retries: Option<u32>,

        /// Estimated tokens (informational)
        #[arg(short = 't', long)]
        estimated_tokens: Option<u64>,

        /// Session id to continue
        #[arg(short, long, conflicts_with = "chat")]
        session: Option<String>,

        /// Chat name to continue
        #[arg(short, long)]
        chat: Option<String>,
    },

    /// Write an editable prompt file into the queue
    Template {
        /// Name used in the file name
        name: String,

        /// Priority written into the header
        #[arg(short, long)]
        priority: Option<i64>,
    },

    /// Show queue status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,

        /// List active prompts too
        #[arg(short, long)]
        detailed: bool,
    },

    /// List prompts, including archived ones
    List {
        /// Filter by status (queued, executing, rate_limited, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show one prompt with its execution log
    Show {
        /// Task ID
        id: String,
    },

    /// Cancel a waiting prompt
    Cancel {
        /// Task ID
        id: String,
    },

    /// Check the external tool responds
    Test,

    /// Named chat sessions
    Chat {
        #[command(subcommand)]
        action: ChatCommands,
    },
}

/// Chat subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ChatCommands {
    /// Queue the first prompt of a new chat
    New {
        /// Chat name
        name: String,

        /// Opening prompt
        prompt: String,

        /// Working directory for the tool
        #[arg(short = 'd', long)]
        working_dir: Option<PathBuf>,
    },

    /// List known chats
    List,
}
