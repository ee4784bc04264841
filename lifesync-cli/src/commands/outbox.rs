use clap::{Args, Subcommand};
use lifesync_core::OutboxEntry;

use super::OutputFormat;
use crate::app::App;

/// Inspect and repair queued writes
#[derive(Args)]
pub struct OutboxCommand {
    #[command(subcommand)]
    command: OutboxSubcommand,
}

#[derive(Subcommand)]
enum OutboxSubcommand {
    /// List writes waiting to be delivered
    List {
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List writes the server kept rejecting
    Dead {
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Queue a dead-lettered write for delivery again
    Retry { sequence: u64 },

    /// Drop a dead-lettered write
    Discard { sequence: u64 },
}

impl OutboxCommand {
    pub async fn run(&self, app: &App) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            OutboxSubcommand::List { format } => {
                let entries = app.engine.pending_writes(&app.owner).await?;
                print_entries(&entries, *format, "No pending writes.")
            }
            OutboxSubcommand::Dead { format } => {
                let entries = app.engine.dead_letters(&app.owner).await?;
                print_entries(&entries, *format, "No dead-lettered writes.")
            }
            OutboxSubcommand::Retry { sequence } => {
                app.engine.retry_dead_letter(*sequence).await?;
                println!("Write #{} queued for the next sync.", sequence);
                Ok(())
            }
            OutboxSubcommand::Discard { sequence } => {
                app.engine.discard_dead_letter(*sequence).await?;
                println!("Write #{} discarded.", sequence);
                Ok(())
            }
        }
    }
}

fn print_entries(
    entries: &[OutboxEntry],
    format: OutputFormat,
    empty: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(entries)?),
        OutputFormat::Text => {
            if entries.is_empty() {
                println!("{}", empty);
            }
            for entry in entries {
                println!("{}", entry);
            }
        }
    }
    Ok(())
}
