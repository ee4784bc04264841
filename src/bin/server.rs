//! LifeSync Sync Server
//!
//! Stores records for every owner and answers the `life` CLI's queries and
//! writes. See [`lifesync::server::config`] for the environment variables
//! and [`lifesync::server::auth`] for the API key file format.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lifesync::server::{router, ApiKeyStore, AppState, ServerConfig, ServerStorage};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lifesync=info,lifesync_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(ServerConfig::from_env()).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Config file: {}", config.config_path.display());

    let storage = Arc::new(ServerStorage::open(&config.database_path()).await?);
    let api_keys = Arc::new(ApiKeyStore::load(&config.config_path));

    let purge = tokio::spawn(purge_loop(storage.clone(), config.tombstone_grace()));

    let app = router(AppState { storage, api_keys });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    purge.abort();
    tracing::info!("Server stopped");
    Ok(())
}

/// Drops tombstones past the grace period, once at startup and then hourly.
async fn purge_loop(storage: Arc<ServerStorage>, grace: chrono::Duration) {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    loop {
        interval.tick().await;
        match storage.purge_tombstones_older_than(grace).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Purged {} tombstone(s)", n),
            Err(e) => tracing::warn!("Tombstone purge failed: {}", e),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
