use std::marker::PhantomData;

use lifesync_core::{CollectionRecord, Filter, Payload, Typed};

use super::engine::{EngineError, SyncEngine};

/// Engine primitives bound to one record type and one owner.
pub struct TypedCollection<'a, T> {
    engine: &'a SyncEngine,
    owner: String,
    _marker: PhantomData<T>,
}

impl<'a, T: CollectionRecord> TypedCollection<'a, T> {
    pub fn new(engine: &'a SyncEngine, owner: impl Into<String>) -> Self {
        Self {
            engine,
            owner: owner.into(),
            _marker: PhantomData,
        }
    }

    fn collection(&self) -> &'static str {
        T::COLLECTION.name()
    }

    /// Lists records, skipping any whose body no longer fits `T`.
    pub async fn list(&self, filter: Option<&Filter>) -> Result<Vec<Typed<T>>, EngineError> {
        let records = self.engine.fetch(self.collection(), &self.owner, filter).await?;
        Ok(records
            .iter()
            .filter_map(|record| match Typed::from_record(record) {
                Ok(typed) => Some(typed),
                Err(e) => {
                    tracing::warn!(record = %record, "Skipping record with unexpected shape: {}", e);
                    None
                }
            })
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Typed<T>>, EngineError> {
        let filter = Filter::new().where_eq("id", id);
        let records = self
            .engine
            .fetch(self.collection(), &self.owner, Some(&filter))
            .await?;
        match records.first() {
            Some(record) => Ok(Some(Typed::from_record(record)?)),
            None => Ok(None),
        }
    }

    pub async fn insert(&self, value: &T) -> Result<Typed<T>, EngineError> {
        let record = self
            .engine
            .insert(self.collection(), &self.owner, value.to_payload()?)
            .await?;
        Ok(Typed::from_record(&record)?)
    }

    /// Replaces the stored fields with those of `value`.
    pub async fn save(&self, id: &str, value: &T) -> Result<(), EngineError> {
        self.patch(id, value.to_payload()?).await
    }

    pub async fn patch(&self, id: &str, partial: Payload) -> Result<(), EngineError> {
        self.engine
            .update(self.collection(), &self.owner, id, partial)
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<(), EngineError> {
        self.engine.delete(self.collection(), &self.owner, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::sync::connectivity::ConnectivityMonitor;
    use crate::sync::engine::EngineSettings;
    use lifesync_core::collections::{Note, Task};
    use lifesync_core::NoRemote;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn offline_engine() -> (tempfile::TempDir, SyncEngine) {
        let (dir, pool) = test_pool().await;
        let remote = Arc::new(NoRemote);
        let monitor = Arc::new(ConnectivityMonitor::new(remote.clone(), Duration::from_secs(1)));
        let engine = SyncEngine::open(pool, remote, monitor, EngineSettings::default())
            .await
            .unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn test_typed_task_lifecycle() {
        let (_dir, engine) = offline_engine().await;
        let tasks = TypedCollection::<Task>::new(&engine, "u1");

        let created = tasks.insert(&Task::new("Water plants")).await.unwrap();
        assert_eq!(created.value.title, "Water plants");
        assert!(!created.value.done);

        tasks
            .patch(&created.id, json!({"done": true}).as_object().cloned().unwrap())
            .await
            .unwrap();
        let fetched = tasks.get(&created.id).await.unwrap().unwrap();
        assert!(fetched.value.done);

        tasks.delete(&created.id).await.unwrap();
        assert!(tasks.get(&created.id).await.unwrap().is_none());
        assert!(tasks.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_skips_misshapen_records() {
        let (_dir, engine) = offline_engine().await;
        engine
            .insert("notes", "u1", json!({"title": 42}).as_object().cloned().unwrap())
            .await
            .unwrap();

        let notes = TypedCollection::<Note>::new(&engine, "u1");
        notes
            .insert(&Note {
                title: "Groceries".into(),
                body: String::new(),
            })
            .await
            .unwrap();

        let listed = notes.list(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].value.title, "Groceries");
    }
}
