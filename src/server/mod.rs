//! Server-side modules for the LifeSync sync server.

pub mod auth;
pub mod config;
pub mod routes;
pub mod storage;

pub use auth::{ApiKeyEntry, ApiKeyStore, AuthUser, ConfigFileError, ServerConfigFile};
pub use config::ServerConfig;
pub use routes::{router, AppState};
pub use storage::{ServerStorage, ServerStorageError};
