use chrono::NaiveDate;
use clap::{Args, Subcommand};
use lifesync_core::collections::Task;
use lifesync_core::{Condition, Filter, Op, Payload, Typed};
use serde_json::Value;

use super::OutputFormat;
use crate::app::App;
use crate::sync::TypedCollection;

#[derive(Args)]
pub struct TaskCommand {
    #[command(subcommand)]
    pub command: TaskSubcommand,
}

#[derive(Subcommand)]
pub enum TaskSubcommand {
    /// Add a task
    Add {
        title: String,

        /// Due date (YYYY-MM-DD)
        #[arg(long)]
        due: Option<String>,

        /// Goal this task contributes to
        #[arg(long)]
        goal: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// List tasks
    List {
        /// Include completed tasks
        #[arg(long, short)]
        all: bool,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show a single task
    Show {
        id: String,

        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Mark a task as done
    Done { id: String },

    /// Change fields of a task
    Update {
        id: String,

        #[arg(long)]
        title: Option<String>,

        /// Due date (YYYY-MM-DD)
        #[arg(long)]
        due: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Delete a task
    Delete { id: String },
}

impl TaskCommand {
    pub async fn run(&self, app: &App) -> Result<(), Box<dyn std::error::Error>> {
        let tasks = TypedCollection::<Task>::new(&app.engine, app.owner.as_str());

        match &self.command {
            TaskSubcommand::Add {
                title,
                due,
                goal,
                notes,
            } => {
                let mut task = Task::new(title);
                if let Some(due) = due {
                    task = task.with_due(parse_date(due)?);
                }
                if let Some(goal) = goal {
                    task = task.with_goal(goal);
                }
                task.notes = notes.clone();

                let created = tasks.insert(&task).await?;
                println!("Added task {}", created.id);
                Ok(())
            }
            TaskSubcommand::List { all, format } => {
                let filter = if *all {
                    Filter::new()
                } else {
                    Filter::new().with_condition(Condition::new("done", Op::Ne, true))
                };
                let listed = tasks.list(Some(&filter.order_by("due", false))).await?;
                print_tasks(&listed, *format)
            }
            TaskSubcommand::Show { id, format } => {
                let task = tasks
                    .get(id)
                    .await?
                    .ok_or_else(|| format!("Task not found: {}", id))?;
                print_tasks(std::slice::from_ref(&task), *format)
            }
            TaskSubcommand::Done { id } => {
                let mut partial = Payload::new();
                partial.insert("done".into(), Value::Bool(true));
                tasks.patch(id, partial).await?;
                println!("Completed task {}", id);
                Ok(())
            }
            TaskSubcommand::Update {
                id,
                title,
                due,
                notes,
            } => {
                let mut partial = Payload::new();
                if let Some(title) = title {
                    partial.insert("title".into(), Value::String(title.clone()));
                }
                if let Some(due) = due {
                    let due = parse_date(due)?;
                    partial.insert("due".into(), Value::String(due.to_string()));
                }
                if let Some(notes) = notes {
                    partial.insert("notes".into(), Value::String(notes.clone()));
                }
                if partial.is_empty() {
                    return Err("Nothing to update. Use --title, --due or --notes.".into());
                }
                tasks.patch(id, partial).await?;
                println!("Updated task {}", id);
                Ok(())
            }
            TaskSubcommand::Delete { id } => {
                tasks.delete(id).await?;
                println!("Deleted task {}", id);
                Ok(())
            }
        }
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| format!("Invalid date format '{}'. Use YYYY-MM-DD.", s))
}

fn print_tasks(tasks: &[Typed<Task>], format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            let values: Vec<Value> = tasks
                .iter()
                .map(|t| {
                    let mut value = serde_json::to_value(&t.value)?;
                    if let Value::Object(map) = &mut value {
                        map.insert("id".into(), Value::String(t.id.clone()));
                    }
                    Ok(value)
                })
                .collect::<Result<_, serde_json::Error>>()?;
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
        OutputFormat::Text => {
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in tasks {
                let mark = if task.value.done { "x" } else { " " };
                print!("[{}] {}  {}", mark, task.id, task.value.title);
                if let Some(due) = task.value.due {
                    print!("  (due {})", due);
                }
                println!();
                if let Some(notes) = &task.value.notes {
                    println!("      {}", notes);
                }
            }
        }
    }
    Ok(())
}
