use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod app;
mod commands;
mod config;
mod db;
mod sync;

use app::App;
use commands::{
    ConfigCommand, OutboxCommand, PurgeCommand, RecordCommand, RecordSubcommand, SyncCommand,
    TaskCommand, TaskSubcommand,
};
use config::Config;

#[derive(Parser)]
#[command(name = "life")]
#[command(version)]
#[command(about = "Personal life manager that works offline and syncs later", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tasks
    Task(TaskCommand),

    /// Read and write records of any collection
    Record(RecordCommand),

    /// Sync with remote server
    Sync(SyncCommand),

    /// Inspect queued writes
    Outbox(OutboxCommand),

    /// Remove confirmed deletions from the local store
    Purge(PurgeCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let cli_config_path = cli.config.clone();
    let config = Config::load(cli.config)?;

    match &cli.command {
        // Works without a database.
        Some(Commands::Config(cmd)) => cmd.run(&config, cli_config_path),
        None => {
            println!("Use --help to see available commands");
            Ok(())
        }
        Some(command) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_with_engine(command, &config))
        }
    }
}

async fn run_with_engine(
    command: &Commands,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = App::open(config).await?;

    // Auto-sync BEFORE read commands
    if is_read_command(command) {
        app.auto_sync().await;
    }

    let result = execute_command(command, &app, config).await;

    // Auto-sync AFTER write commands (only if command succeeded)
    if result.is_ok() && is_write_command(command) {
        app.auto_sync().await;
    }

    app.close().await;
    result
}

async fn execute_command(
    command: &Commands,
    app: &App,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Task(cmd) => cmd.run(app).await,
        Commands::Record(cmd) => cmd.run(app).await,
        Commands::Sync(cmd) => cmd.run(app, config).await,
        Commands::Outbox(cmd) => cmd.run(app).await,
        Commands::Purge(cmd) => cmd.run(app).await,
        Commands::Config(cmd) => cmd.run(config, None),
    }
}

/// Returns true if the command is a read operation that should sync before execution.
fn is_read_command(cmd: &Commands) -> bool {
    matches!(
        cmd,
        Commands::Task(t) if matches!(t.command,
            TaskSubcommand::List { .. } | TaskSubcommand::Show { .. })
    ) || matches!(
        cmd,
        Commands::Record(r) if matches!(r.command, RecordSubcommand::List { .. })
    )
}

/// Returns true if the command is a write operation that should sync after execution.
fn is_write_command(cmd: &Commands) -> bool {
    matches!(
        cmd,
        Commands::Task(t) if matches!(t.command,
            TaskSubcommand::Add { .. }
            | TaskSubcommand::Done { .. }
            | TaskSubcommand::Update { .. }
            | TaskSubcommand::Delete { .. })
    ) || matches!(
        cmd,
        Commands::Record(r) if matches!(r.command,
            RecordSubcommand::Add { .. }
            | RecordSubcommand::Update { .. }
            | RecordSubcommand::Delete { .. })
    )
}
