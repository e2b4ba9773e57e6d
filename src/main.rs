use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

mod cli;

use cli::Cli;
use cli::commands::{ChatCommands, Commands};
use promptq::config::Config;
use promptq::detect::RateLimitDetector;
use promptq::domain::{QueueState, Task, TaskStatus};
use promptq::runner::{CommandRunner, Runner};
use promptq::scheduler::{ManagerConfig, QueueManager};
use promptq::session::SqliteSessionDirectory;
use promptq::store::MarkdownStore;
use promptq::store::record;

/// Exit code after SIGINT/SIGTERM
const EXIT_INTERRUPTED: u8 = 130;

fn setup_logging(level: Option<&str>, verbose: bool) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("promptq")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("promptq.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let default_level = if verbose { "debug" } else { level.unwrap_or("info") };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn build_manager(config: &Config) -> Result<QueueManager> {
    let root = config.storage_root();
    let store = MarkdownStore::open(&root).context("Failed to open queue storage")?;
    let chats_dir = store.chats_dir().to_path_buf();
    let sessions =
        SqliteSessionDirectory::open(root.join("sessions.db")).context("Failed to open session directory")?;

    let manager = QueueManager::new(
        ManagerConfig::from_config(config),
        Box::new(store),
        Arc::new(CommandRunner::new(config.runner.clone())),
        Arc::new(sessions),
        RateLimitDetector::new(&config.rate_limit),
    )
    .with_transcripts(chats_dir);
    Ok(manager)
}

async fn run_application(cli: &Cli, config: &Config) -> Result<ExitCode> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.cmd {
        Commands::Start => handle_start_command(config).await,
        Commands::Add {
            prompt,
            priority,
            working_dir,
            context_files,
            max_retries,
            estimated_tokens,
            session,
            chat,
        } => {
            let working_dir = resolve_working_dir(working_dir.as_deref())?;
            let task = Task::new(prompt.as_str(), working_dir)
                .with_priority(priority.unwrap_or(config.defaults.priority))
                .with_max_retries(max_retries.unwrap_or(config.defaults.max_retries))
                .with_context_files(context_files)
                .with_estimated_tokens(*estimated_tokens);
            handle_add_command(task, session.as_deref(), chat.as_deref(), config)
        }
        Commands::Template { name, priority } => {
            handle_template_command(name, priority.unwrap_or(config.defaults.priority), config)
        }
        Commands::Status { json, detailed } => handle_status_command(*json, *detailed, config),
        Commands::List { status } => handle_list_command(status.as_deref(), config),
        Commands::Show { id } => handle_show_command(id, config),
        Commands::Cancel { id } => handle_cancel_command(id, config),
        Commands::Test => handle_test_command(config).await,
        Commands::Chat { action } => handle_chat_command(action, config),
    }
}

fn resolve_working_dir(dir: Option<&Path>) -> Result<PathBuf> {
    match dir {
        Some(dir) => Ok(promptq::config::expand_home(dir)),
        None => std::env::current_dir().context("Failed to read current directory"),
    }
}

async fn handle_start_command(config: &Config) -> Result<ExitCode> {
    let manager = build_manager(config)?;
    let mut manager = manager.with_observer(|state: &QueueState| {
        let stats = state.stats();
        let count = |key: &str| stats.status_counts.get(key).copied().unwrap_or(0);
        println!(
            "{} {} queued, {} rate limited, {} processed",
            "Queue:".cyan(),
            count("queued"),
            count("rate_limited"),
            stats.total_processed
        );
        Ok(())
    });

    let version = manager.startup().await.context("External tool is not available")?;
    println!("{} {}", "Runner:".green(), version);
    println!(
        "{} checking every {}s (Ctrl+C to stop)",
        "Started:".green(),
        manager.config().check_interval.as_secs()
    );

    manager.run(shutdown_signal()).await.context("Failed to save queue on shutdown")?;
    println!("{}", "Stopped, queue state saved".yellow());
    Ok(ExitCode::from(EXIT_INTERRUPTED))
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

fn handle_add_command(task: Task, session: Option<&str>, chat: Option<&str>, config: &Config) -> Result<ExitCode> {
    let mut manager = build_manager(config)?;

    let task = match (session, chat) {
        (Some(session_id), _) => task.with_session(session_id, None),
        (None, Some(name)) => {
            let session_id = manager
                .find_session(name)?
                .ok_or_else(|| eyre!("No chat named '{}'; create it with `promptq chat new`", name))?;
            task.with_session(session_id, Some(name.to_string()))
        }
        (None, None) => task,
    };

    let priority = task.priority;
    let task_id = manager.submit(task)?;
    println!("{} {} (priority {})", "Added:".green(), task_id, priority);
    Ok(ExitCode::SUCCESS)
}

fn handle_template_command(name: &str, priority: i64, config: &Config) -> Result<ExitCode> {
    let store = MarkdownStore::open(config.storage_root())?;
    let path = store.create_template(name, priority, config.defaults.max_retries)?;
    println!("{} {}", "Created template:".green(), path.display());
    println!("Edit the file, then run `promptq start` to process it.");
    Ok(ExitCode::SUCCESS)
}

fn handle_status_command(json: bool, detailed: bool, config: &Config) -> Result<ExitCode> {
    let mut manager = build_manager(config)?;
    let stats = manager.status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("{}", "Queue status".bold());
    println!("  Total tasks:      {}", stats.total_tasks);
    for (status, count) in &stats.status_counts {
        if *count > 0 {
            println!("  {:<17} {}", format!("{}:", status), count);
        }
    }
    println!("  Processed:        {}", stats.total_processed);
    println!("  Failed:           {}", stats.failed_count);
    println!("  Rate limited:     {}", stats.rate_limited_count);
    if let Some(at) = stats.last_processed {
        println!("  Last processed:   {}", at.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(at) = stats.next_reset {
        println!("  Next reset:       {}", at.format("%Y-%m-%d %H:%M:%S").to_string().yellow());
    }

    if detailed {
        println!();
        for task in manager.state().tasks.iter() {
            print_task_line(task);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_list_command(status: Option<&str>, config: &Config) -> Result<ExitCode> {
    let filter = status.map(str::parse::<TaskStatus>).transpose()?;
    let mut manager = build_manager(config)?;

    let tasks: Vec<Task> = manager
        .tasks(true)?
        .into_iter()
        .filter(|t| filter.is_none_or(|s| t.status == s))
        .collect();

    if tasks.is_empty() {
        println!("{}", "No tasks".yellow());
    }
    for task in &tasks {
        print_task_line(task);
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_show_command(id: &str, config: &Config) -> Result<ExitCode> {
    let manager = build_manager(config)?;
    let task = manager
        .find_task(id)?
        .ok_or_else(|| eyre!("Task not found: {}", id))?;
    print!("{}", record::render(&task)?);
    Ok(ExitCode::SUCCESS)
}

fn handle_cancel_command(id: &str, config: &Config) -> Result<ExitCode> {
    let mut manager = build_manager(config)?;
    manager.cancel(id)?;
    println!("{} {}", "Cancelled:".red(), id);
    Ok(ExitCode::SUCCESS)
}

async fn handle_test_command(config: &Config) -> Result<ExitCode> {
    let runner = CommandRunner::new(config.runner.clone());
    match runner.check_available().await {
        Ok(message) => {
            println!("{} {}", "OK:".green(), message);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("{} {}", "Unavailable:".red(), e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn handle_chat_command(action: &ChatCommands, config: &Config) -> Result<ExitCode> {
    let mut manager = build_manager(config)?;
    match action {
        ChatCommands::New {
            name,
            prompt,
            working_dir,
        } => {
            let working_dir = resolve_working_dir(working_dir.as_deref())?;
            let task = manager.create_chat(name, prompt, &working_dir)?;
            println!("{} {} (task {})", "Chat queued:".green(), name, task.id);
            println!("Follow up with `promptq add <prompt> -c {}`", name);
        }
        ChatCommands::List => {
            let chats = manager.chats()?;
            if chats.is_empty() {
                println!("{}", "No chats".yellow());
            }
            for chat in chats {
                println!(
                    "{:<20} {} {:>4} prompts  last used {}  {}",
                    chat.chat_name.cyan(),
                    chat.session_id,
                    chat.total_prompts,
                    chat.last_used.format("%Y-%m-%d %H:%M"),
                    chat.working_directory.display()
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_task_line(task: &Task) {
    let status = match task.status {
        TaskStatus::Queued => task.status.as_str().normal(),
        TaskStatus::Executing => task.status.as_str().cyan(),
        TaskStatus::RateLimited => task.status.as_str().yellow(),
        TaskStatus::Completed => task.status.as_str().green(),
        TaskStatus::Failed | TaskStatus::Cancelled => task.status.as_str().red(),
    };
    let title: String = task.content.lines().next().unwrap_or_default().chars().take(60).collect();
    println!(
        "{}  {:<12}  p{:<3} retries {}/{}  {}",
        task.id, status, task.priority, task.retry_count, task.max_retries, title
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments
    let cli = Cli::parse();

    match try_main(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red(), e);
            ExitCode::FAILURE
        }
    }
}

async fn try_main(cli: &Cli) -> Result<ExitCode> {
    // Load configuration
    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    cli.apply_overrides(&mut config);
    config.validate().context("Invalid configuration")?;

    // Setup logging
    setup_logging(config.log_level.as_deref(), cli.is_verbose()).context("Failed to setup logging")?;
    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(cli, &config).await.context("Application failed")
}
