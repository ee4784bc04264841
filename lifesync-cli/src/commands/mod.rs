use clap::ValueEnum;
use lifesync_core::collections::payload_from_value;
use lifesync_core::{Payload, Record};

mod config_cmd;
mod outbox;
mod purge;
mod record;
mod sync_cmd;
mod task;

pub use config_cmd::ConfigCommand;
pub use outbox::OutboxCommand;
pub use purge::PurgeCommand;
pub use record::{RecordCommand, RecordSubcommand};
pub use sync_cmd::SyncCommand;
pub use task::{TaskCommand, TaskSubcommand};

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Parses a JSON object given on the command line.
pub(crate) fn parse_payload(json: &str) -> Result<Payload, Box<dyn std::error::Error>> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| format!("Invalid JSON payload: {}", e))?;
    Ok(payload_from_value(value)?)
}

pub(crate) fn print_record(record: &Record) {
    println!("{}", record.id);
    for (key, value) in &record.payload {
        println!("  {}: {}", key, value);
    }
    println!("  updated_at: {}", record.updated_at.format("%Y-%m-%d %H:%M:%S"));
}
