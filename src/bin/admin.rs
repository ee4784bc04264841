//! LifeSync Admin CLI
//!
//! Administration tool for the sync server.
//!
//! # Usage
//!
//! ```bash
//! lifesync-admin key add alice
//! lifesync-admin key list
//! lifesync-admin key remove alice
//! lifesync-admin purge --grace-hours 24
//! lifesync-admin stats
//! ```
//!
//! Uses the same `LIFESYNC_DATA_DIR` and `LIFESYNC_CONFIG` variables as the
//! server. Key changes take effect when the server restarts.

use clap::{Args, Parser, Subcommand};
use lifesync::server::{ApiKeyEntry, ServerConfig, ServerConfigFile, ServerStorage};

#[derive(Parser)]
#[command(name = "lifesync-admin")]
#[command(version)]
#[command(about = "LifeSync server administration tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage API keys
    Key(KeyCommand),

    /// Remove deletions older than the grace period
    Purge {
        /// Override LIFESYNC_TOMBSTONE_GRACE_HOURS
        #[arg(long)]
        grace_hours: Option<i64>,
    },

    /// Show stored record counts per owner and collection
    Stats,
}

#[derive(Args)]
struct KeyCommand {
    #[command(subcommand)]
    command: KeySubcommand,
}

#[derive(Subcommand)]
enum KeySubcommand {
    /// Generate a key for a user
    Add {
        /// Owner the key grants access to
        user_id: String,
    },
    /// List configured keys
    List,
    /// Remove every key of a user
    Remove { user_id: String },
}

fn generate_key() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Shows the first characters of a key only.
fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(8).collect();
    format!("{}…", prefix)
}

fn add_key(config: &ServerConfig, user_id: String) -> Result<(), Box<dyn std::error::Error>> {
    if user_id.trim().is_empty() {
        return Err("User id must not be empty".into());
    }

    let mut file = ServerConfigFile::load(&config.config_path)?;
    let key = generate_key();
    file.api_keys.push(ApiKeyEntry {
        key: key.clone(),
        user_id: user_id.clone(),
    });
    file.save(&config.config_path)?;

    println!("Added key for: {}", user_id);
    println!("  Key: {}", key);
    println!();
    println!("Store it now; it is only shown in full once.");
    Ok(())
}

fn list_keys(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let file = ServerConfigFile::load(&config.config_path)?;

    if file.api_keys.is_empty() {
        println!("No API keys configured.");
        return Ok(());
    }

    println!("{:<40} {:<20}", "USER", "KEY");
    println!("{}", "-".repeat(60));
    for entry in &file.api_keys {
        println!("{:<40} {:<20}", entry.user_id, mask_key(&entry.key));
    }
    println!();
    println!("Total: {} key(s)", file.api_keys.len());
    Ok(())
}

fn remove_keys(config: &ServerConfig, user_id: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut file = ServerConfigFile::load(&config.config_path)?;
    let before = file.api_keys.len();
    file.api_keys.retain(|entry| entry.user_id != user_id);
    let removed = before - file.api_keys.len();

    if removed == 0 {
        return Err(format!("No keys found for '{}'", user_id).into());
    }

    file.save(&config.config_path)?;
    println!("Removed {} key(s) for: {}", removed, user_id);
    Ok(())
}

async fn purge(
    config: &ServerConfig,
    grace_hours: Option<i64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let grace = match grace_hours {
        Some(h) if h < 0 => return Err("Grace period must not be negative".into()),
        Some(h) => chrono::Duration::hours(h),
        None => config.tombstone_grace(),
    };

    let storage = ServerStorage::open(&config.database_path()).await?;
    let purged = storage.purge_tombstones_older_than(grace).await?;
    println!("Purged {} tombstone(s)", purged);
    Ok(())
}

async fn stats(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let storage = ServerStorage::open(&config.database_path()).await?;
    let rows = storage.stats().await?;

    if rows.is_empty() {
        println!("No records stored.");
        return Ok(());
    }

    println!("{:<20} {:<20} {:>8} {:>8}", "OWNER", "COLLECTION", "LIVE", "DELETED");
    println!("{}", "-".repeat(60));
    for (collection, owner, live, deleted) in rows {
        println!("{:<20} {:<20} {:>8} {:>8}", owner, collection, live, deleted);
    }
    Ok(())
}

fn block_on(
    future: impl std::future::Future<Output = Result<(), Box<dyn std::error::Error>>>,
) -> Result<(), Box<dyn std::error::Error>> {
    tokio::runtime::Runtime::new()?.block_on(future)
}

fn main() {
    let cli = Cli::parse();
    let config = ServerConfig::from_env();

    let result = match cli.command {
        Commands::Key(key_cmd) => match key_cmd.command {
            KeySubcommand::Add { user_id } => add_key(&config, user_id),
            KeySubcommand::List => list_keys(&config),
            KeySubcommand::Remove { user_id } => remove_keys(&config, user_id),
        },
        Commands::Purge { grace_hours } => block_on(purge(&config, grace_hours)),
        Commands::Stats => block_on(stats(&config)),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
