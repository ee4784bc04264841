//! Server configuration from environment variables.
//!
//! - `LIFESYNC_PORT`: port to listen on (default: 8080)
//! - `LIFESYNC_DATA_DIR`: database directory (default: ~/.local/share/lifesync-server)
//! - `LIFESYNC_CONFIG`: API key file (default: ~/.config/lifesync-server/config.yaml)
//! - `LIFESYNC_TOMBSTONE_GRACE_HOURS`: how long deletions are kept (default: 72)

use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TOMBSTONE_GRACE_HOURS: i64 = 72;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub tombstone_grace_hours: i64,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source. Unparseable numbers fall
    /// back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = lookup("LIFESYNC_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let data_dir = lookup("LIFESYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("lifesync-server")
            });

        let config_path = lookup("LIFESYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("lifesync-server")
                    .join("config.yaml")
            });

        let tombstone_grace_hours = lookup("LIFESYNC_TOMBSTONE_GRACE_HOURS")
            .and_then(|h| h.parse().ok())
            .filter(|h: &i64| *h >= 0)
            .unwrap_or(DEFAULT_TOMBSTONE_GRACE_HOURS);

        Self {
            port,
            data_dir,
            config_path,
            tombstone_grace_hours,
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("lifesync.db")
    }

    pub fn tombstone_grace(&self) -> chrono::Duration {
        chrono::Duration::hours(self.tombstone_grace_hours)
    }
}
