use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Key = (String, String);

/// One async mutex per (collection, owner), created on first use.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<Key, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, collection: &str, owner: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry((collection.to_string(), owner.to_string()))
            .or_default()
            .clone()
    }

    pub async fn lock(&self, collection: &str, owner: &str) -> OwnedMutexGuard<()> {
        self.slot(collection, owner).lock_owned().await
    }

    /// Takes the lock only if nobody holds it.
    pub fn try_lock(&self, collection: &str, owner: &str) -> Option<OwnedMutexGuard<()>> {
        self.slot(collection, owner).try_lock_owned().ok()
    }
}
