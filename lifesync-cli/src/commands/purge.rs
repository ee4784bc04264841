use clap::Args;

use crate::app::App;

/// Remove deleted records whose deletion the server has confirmed
#[derive(Args)]
pub struct PurgeCommand {}

impl PurgeCommand {
    pub async fn run(&self, app: &App) -> Result<(), Box<dyn std::error::Error>> {
        let purged = app.engine.purge_tombstones().await?;
        let grace = app.engine.settings().tombstone_grace;
        println!(
            "Purged {} deleted record(s) older than {} hour(s).",
            purged,
            grace.num_hours()
        );
        Ok(())
    }
}
