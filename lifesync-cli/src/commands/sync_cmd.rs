//! Sync CLI commands for reconciling with the server.

use clap::{Args, Subcommand};
use serde_json::json;

use super::OutputFormat;
use crate::app::App;
use crate::config::Config;
use crate::sync::{ReconcileReport, SyncOutcome};

/// Sync with remote server
#[derive(Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,
}

#[derive(Subcommand)]
enum SyncSubcommand {
    /// Show connectivity, pending writes and pull cursors
    Status {
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Forget pull cursors so the next sync re-reads everything
    Resync {
        /// Only this collection
        #[arg(long)]
        collection: Option<String>,
    },

    /// Stay running and sync whenever the server becomes reachable
    Watch,
}

impl SyncCommand {
    pub async fn run(&self, app: &App, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            None => self.sync(app, config).await,
            Some(SyncSubcommand::Status { format }) => self.status(app, config, *format).await,
            Some(SyncSubcommand::Resync { collection }) => {
                app.engine
                    .resync_from_scratch(&app.owner, collection.as_deref())
                    .await?;
                match collection {
                    Some(c) => println!("Cursor for '{}' reset.", c),
                    None => println!("All cursors reset."),
                }
                if config.sync.is_configured() {
                    self.sync(app, config).await?;
                }
                Ok(())
            }
            Some(SyncSubcommand::Watch) => self.watch(app, config).await,
        }
    }

    async fn sync(&self, app: &App, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        if !config.sync.is_configured() {
            return Err(
                "Sync is not configured. Set sync.server_url and sync.api_key in the config file."
                    .into(),
            );
        }

        println!("Syncing with server...");
        println!();

        match app.scheduler.sync_now(&app.owner).await? {
            SyncOutcome::Completed(report) => print_report(&report),
            SyncOutcome::Coalesced => println!("A sync is already running."),
            SyncOutcome::Failed(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn status(
        &self,
        app: &App,
        config: &Config,
        format: OutputFormat,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let status = app.engine.status(&app.owner).await?;

        if let OutputFormat::Json = format {
            let cursors: Vec<_> = status
                .cursors
                .iter()
                .map(|c| json!({"collection": c.collection, "last_synced_at": c.last_synced_at}))
                .collect();
            let value = json!({
                "configured": config.sync.is_configured(),
                "server_url": config.sync.server_url,
                "online": status.online,
                "last_transition_at": status.last_transition_at,
                "pending": status.pending,
                "dead_letters": status.dead_letters,
                "cursors": cursors,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
            return Ok(());
        }

        println!("Sync Status");
        println!("===========");
        println!();

        match &config.sync.server_url {
            Some(url) if config.sync.is_configured() => {
                println!("Server:    {}", url);
                println!(
                    "Status:    {}",
                    if status.online { "✓ online" } else { "✗ unreachable" }
                );
            }
            _ => {
                println!("Status:    Not configured");
                println!();
                println!("To enable sync, add to your config file:");
                println!();
                println!("  sync:");
                println!("    server_url: \"http://localhost:8080\"");
                println!("    api_key: \"<key from lifesync-admin>\"");
                println!();
                println!("Or set LIFE_SYNC_URL and LIFE_SYNC_API_KEY.");
            }
        }
        println!(
            "Auto-sync: {}",
            if config.sync.auto_sync { "enabled" } else { "disabled" }
        );
        println!();
        println!("Pending writes: {}", status.pending);
        println!("Dead letters:   {}", status.dead_letters.len());

        if !status.cursors.is_empty() {
            println!();
            println!("Last pulled:");
            for cursor in &status.cursors {
                println!(
                    "  {:<16} {}",
                    cursor.collection,
                    cursor.last_synced_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Ok(())
    }

    async fn watch(&self, app: &App, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        if !config.sync.is_configured() {
            return Err("Sync is not configured.".into());
        }

        // Registers the owner with the scheduler so reconnects sync it.
        app.scheduler.app_foreground(&app.owner).await?;
        let probes = app
            .engine
            .monitor()
            .clone()
            .spawn_probe_loop(app.probe_interval());

        println!("Watching for connectivity changes. Press Ctrl-C to stop.");
        tokio::signal::ctrl_c().await?;
        probes.abort();
        app.scheduler.app_background().await?;
        Ok(())
    }
}

fn print_report(report: &ReconcileReport) {
    if report.offline {
        println!("  ✗ server unreachable, writes stay queued");
        return;
    }

    for collection in &report.collections {
        if let Some(e) = &collection.error {
            println!("  ✗ {} - {}", collection.collection, e);
            continue;
        }
        if collection.pushed == 0 && collection.pulled == 0 && !collection.stalled {
            continue;
        }
        let mark = if collection.stalled || collection.cancelled {
            "…"
        } else {
            "✓"
        };
        println!(
            "  {} {} (pushed {}, pulled {})",
            mark, collection.collection, collection.pushed, collection.pulled
        );
    }

    let dead = report.dead_lettered();
    println!();
    if !dead.is_empty() {
        println!(
            "{} write(s) were rejected by the server. See 'life outbox dead'.",
            dead.len()
        );
    }
    let held = report.held();
    if held > 0 {
        println!("{} write(s) are waiting behind a rejected one.", held);
    }
    if report.is_complete() {
        println!("Sync complete.");
    } else {
        println!("Sync incomplete; remaining writes will be retried.");
    }
}
