use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per (collection, owner) pull watermark, in server time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub collection: String,
    pub owner: String,
    pub last_synced_at: DateTime<Utc>,
}

impl SyncCursor {
    pub fn new(
        collection: impl Into<String>,
        owner: impl Into<String>,
        last_synced_at: DateTime<Utc>,
    ) -> Self {
        Self {
            collection: collection.into(),
            owner: owner.into(),
            last_synced_at,
        }
    }
}

/// Process-wide reachability snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub online: bool,
    pub last_transition_at: DateTime<Utc>,
}

impl ConnectivityState {
    pub fn offline() -> Self {
        Self {
            online: false,
            last_transition_at: super::record::now(),
        }
    }
}
