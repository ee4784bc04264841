use clap::{Args, Subcommand};
use lifesync_core::{Condition, Filter};

use super::{parse_payload, print_record, OutputFormat};
use crate::app::App;

/// Generic access to any collection, including ones without a typed model
#[derive(Args)]
pub struct RecordCommand {
    #[command(subcommand)]
    pub command: RecordSubcommand,
}

#[derive(Subcommand)]
pub enum RecordSubcommand {
    /// Insert a record from a JSON object
    Add {
        collection: String,

        /// Payload, e.g. '{"name": "Read 20 pages"}'
        json: String,
    },

    /// List records of a collection
    List {
        collection: String,

        /// Condition such as 'done=false' or 'amount>=10' (repeatable)
        #[arg(long = "where", short = 'w', value_name = "CONDITION")]
        conditions: Vec<String>,

        /// Field to order by
        #[arg(long)]
        order_by: Option<String>,

        /// Order descending
        #[arg(long)]
        desc: bool,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Merge a JSON object into a record
    Update {
        collection: String,
        id: String,
        json: String,
    },

    /// Delete a record
    Delete { collection: String, id: String },
}

impl RecordCommand {
    pub async fn run(&self, app: &App) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            RecordSubcommand::Add { collection, json } => {
                let record = app
                    .engine
                    .insert(collection, &app.owner, parse_payload(json)?)
                    .await?;
                println!("Added {}", record);
                Ok(())
            }
            RecordSubcommand::List {
                collection,
                conditions,
                order_by,
                desc,
                limit,
                format,
            } => {
                let filter = build_filter(conditions, order_by.as_deref(), *desc, *limit)?;
                let records = app.engine.fetch(collection, &app.owner, Some(&filter)).await?;
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&records)?);
                    }
                    OutputFormat::Text => {
                        if records.is_empty() {
                            println!("No records in '{}'.", collection);
                        }
                        for record in &records {
                            print_record(record);
                        }
                    }
                }
                Ok(())
            }
            RecordSubcommand::Update {
                collection,
                id,
                json,
            } => {
                app.engine
                    .update(collection, &app.owner, id, parse_payload(json)?)
                    .await?;
                println!("Updated {}/{}", collection, id);
                Ok(())
            }
            RecordSubcommand::Delete { collection, id } => {
                app.engine.delete(collection, &app.owner, id).await?;
                println!("Deleted {}/{}", collection, id);
                Ok(())
            }
        }
    }
}

fn build_filter(
    conditions: &[String],
    order_by: Option<&str>,
    descending: bool,
    limit: Option<usize>,
) -> Result<Filter, Box<dyn std::error::Error>> {
    let mut filter = Filter::new();
    for condition in conditions {
        filter = filter.with_condition(Condition::parse(condition)?);
    }
    if let Some(field) = order_by {
        filter = filter.order_by(field, descending);
    }
    if let Some(limit) = limit {
        filter = filter.limit(limit);
    }
    Ok(filter)
}
