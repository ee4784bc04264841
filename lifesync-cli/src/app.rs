//! Wiring shared by every command: database, remote, engine and scheduler.

use std::sync::Arc;
use std::time::Duration;

use lifesync_core::{HttpRemoteClient, NoRemote, RemoteClient};

use crate::config::Config;
use crate::db::init_db;
use crate::sync::{ConnectivityMonitor, SyncEngine, SyncOutcome, SyncScheduler};

pub struct App {
    pub engine: Arc<SyncEngine>,
    pub scheduler: SyncScheduler,
    pub owner: String,
    auto_sync: bool,
    probe_interval: Duration,
}

impl App {
    /// Opens the local database and connects the engine to the configured
    /// server, or to nothing when sync is not set up.
    pub async fn open(config: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        let pool = init_db(&config.database_path()).await?;

        let remote: Arc<dyn RemoteClient> = match (&config.sync.server_url, config.sync.is_configured()) {
            (Some(url), true) => Arc::new(HttpRemoteClient::new(
                url.clone(),
                config.sync.api_key.clone(),
                config.sync.call_timeout(),
            )?),
            _ => Arc::new(NoRemote),
        };

        let monitor = Arc::new(ConnectivityMonitor::new(
            remote.clone(),
            config.sync.call_timeout(),
        ));
        if config.sync.is_configured() {
            monitor.probe().await;
        }

        let engine = Arc::new(
            SyncEngine::open(pool, remote, monitor, config.sync.engine_settings()).await?,
        );
        let scheduler = SyncScheduler::start(engine.clone());

        Ok(Self {
            engine,
            scheduler,
            owner: config.owner.value.clone(),
            auto_sync: config.sync.auto_sync && config.sync.is_configured(),
            probe_interval: Duration::from_secs(config.sync.probe_interval_secs.max(1)),
        })
    }

    pub fn probe_interval(&self) -> Duration {
        self.probe_interval
    }

    /// Reconciles if auto-sync is enabled. Failures only produce a warning;
    /// the command still runs against local data.
    pub async fn auto_sync(&self) {
        if !self.auto_sync {
            return;
        }
        match self.scheduler.sync_now(&self.owner).await {
            Ok(SyncOutcome::Completed(report)) if report.offline => {
                eprintln!("Auto-sync: server unreachable, skipping");
            }
            Ok(SyncOutcome::Completed(report)) => {
                let dead = report.dead_lettered();
                if !dead.is_empty() {
                    eprintln!(
                        "Auto-sync: {} write(s) rejected by the server, see 'life outbox dead'",
                        dead.len()
                    );
                }
            }
            Ok(SyncOutcome::Coalesced) => {}
            Ok(SyncOutcome::Failed(e)) => eprintln!("Auto-sync: {}", e),
            Err(e) => eprintln!("Auto-sync: {}", e),
        }
    }

    pub async fn close(self) {
        if let Err(e) = self.scheduler.shutdown().await {
            tracing::debug!("Scheduler already stopped: {}", e);
        }
    }
}
