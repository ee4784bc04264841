//! On-device mirror of remote records.
//!
//! Each collection lives in its own `records_<collection>` table keyed by
//! `(owner, id)`. Tables are created the first time a collection is touched
//! and listed in the `collections` registry.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::Duration;
use lifesync_core::collections::{validate_collection_name, validate_scope};
use lifesync_core::models::{next_timestamp, now, timestamp_key};
use lifesync_core::{apply_filter, ConflictResolver, Filter, Payload, Record, ValidationError, Winner};
use sqlx::{SqliteConnection, SqlitePool};

use super::{parse_timestamp, StoreError};

#[derive(sqlx::FromRow)]
struct RecordRow {
    owner: String,
    id: String,
    payload: String,
    updated_at: String,
    deleted: bool,
}

pub struct LocalStore {
    pool: SqlitePool,
    tables: Mutex<HashSet<String>>,
    /// (collection, owner) pairs where an unreadable row was dropped.
    corrupted: Mutex<HashSet<(String, String)>>,
}

fn table_name(collection: &str) -> String {
    format!("records_{}", collection)
}

fn decode(collection: &str, row: &RecordRow) -> Option<Record> {
    let payload: Payload = serde_json::from_str(&row.payload).ok()?;
    let updated_at = parse_timestamp(&row.updated_at)?;
    Some(Record {
        collection: collection.to_string(),
        owner: row.owner.clone(),
        id: row.id.clone(),
        payload,
        updated_at,
        deleted: row.deleted,
    })
}

async fn read_row(
    conn: &mut SqliteConnection,
    collection: &str,
    owner: &str,
    id: &str,
) -> Result<Option<RecordRow>, sqlx::Error> {
    sqlx::query_as::<_, RecordRow>(&format!(
        "SELECT owner, id, payload, updated_at, deleted FROM {} WHERE owner = ? AND id = ?",
        table_name(collection)
    ))
    .bind(owner)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
}

async fn write_row(conn: &mut SqliteConnection, record: &Record) -> Result<(), StoreError> {
    let payload = serde_json::to_string(&record.payload)?;
    sqlx::query(&format!(
        r#"
        INSERT INTO {} (owner, id, payload, updated_at, deleted)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(owner, id) DO UPDATE SET
            payload = excluded.payload,
            updated_at = excluded.updated_at,
            deleted = excluded.deleted
        "#,
        table_name(&record.collection)
    ))
    .bind(&record.owner)
    .bind(&record.id)
    .bind(&payload)
    .bind(timestamp_key(record.updated_at))
    .bind(record.deleted)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_row(
    conn: &mut SqliteConnection,
    collection: &str,
    owner: &str,
    id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(&format!(
        "DELETE FROM {} WHERE owner = ? AND id = ?",
        table_name(collection)
    ))
    .bind(owner)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

fn validate_key(record: &Record) -> Result<(), ValidationError> {
    validate_scope(&record.collection, &record.owner)?;
    if record.id.trim().is_empty() {
        return Err(ValidationError::EmptyId);
    }
    Ok(())
}

impl LocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            tables: Mutex::new(HashSet::new()),
            corrupted: Mutex::new(HashSet::new()),
        }
    }

    /// Creates the collection's table if this process has not seen it yet.
    async fn ensure_table(&self, collection: &str) -> Result<(), StoreError> {
        validate_collection_name(collection)?;
        if self.lock_tables().contains(collection) {
            return Ok(());
        }

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                owner TEXT NOT NULL,
                id TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (owner, id)
            )
            "#,
            table_name(collection)
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO collections (name, created_at) VALUES (?, ?)")
            .bind(collection)
            .bind(timestamp_key(now()))
            .execute(&self.pool)
            .await?;

        self.lock_tables().insert(collection.to_string());
        Ok(())
    }

    fn lock_tables(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_corrupted(&self) -> std::sync::MutexGuard<'_, HashSet<(String, String)>> {
        self.corrupted.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Decodes a row, dropping it if it cannot be read.
    async fn decode_or_discard(
        &self,
        conn: &mut SqliteConnection,
        collection: &str,
        row: RecordRow,
    ) -> Result<Option<Record>, StoreError> {
        if let Some(record) = decode(collection, &row) {
            return Ok(Some(record));
        }

        tracing::warn!(
            collection,
            owner = %row.owner,
            id = %row.id,
            "Dropping unreadable local record"
        );
        delete_row(conn, collection, &row.owner, &row.id).await?;
        self.lock_corrupted()
            .insert((collection.to_string(), row.owner));
        Ok(None)
    }

    /// Point read. Returns tombstones too.
    pub async fn get(
        &self,
        collection: &str,
        owner: &str,
        id: &str,
    ) -> Result<Option<Record>, StoreError> {
        self.ensure_table(collection).await?;
        let mut conn = self.pool.acquire().await?;
        match read_row(&mut conn, collection, owner, id).await? {
            Some(row) => self.decode_or_discard(&mut conn, collection, row).await,
            None => Ok(None),
        }
    }

    /// Live records of (collection, owner) with `filter` applied.
    pub async fn scan(
        &self,
        collection: &str,
        owner: &str,
        filter: Option<&Filter>,
    ) -> Result<Vec<Record>, StoreError> {
        self.ensure_table(collection).await?;
        let mut conn = self.pool.acquire().await?;

        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            "SELECT owner, id, payload, updated_at, deleted FROM {} WHERE owner = ? AND deleted = 0",
            table_name(collection)
        ))
        .bind(owner)
        .fetch_all(&mut *conn)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(record) = self.decode_or_discard(&mut conn, collection, row).await? {
                records.push(record);
            }
        }
        Ok(apply_filter(filter, records))
    }

    /// Last-write-wins upsert. A record older than the stored one is
    /// ignored; equal timestamps overwrite. Returns whether it was stored.
    pub async fn put(&self, record: &Record) -> Result<bool, StoreError> {
        validate_key(record)?;
        self.ensure_table(&record.collection).await?;

        let mut tx = self.pool.begin().await?;
        let stored: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT updated_at FROM {} WHERE owner = ? AND id = ?",
            table_name(&record.collection)
        ))
        .bind(&record.owner)
        .bind(&record.id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(stored_at) = stored.and_then(|(ts,)| parse_timestamp(&ts)) {
            if stored_at > record.updated_at {
                return Ok(false);
            }
        }

        write_row(&mut tx, record).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Merges remote versions in one transaction, letting `resolver` decide
    /// each conflict. Returns how many local records changed.
    pub async fn merge(
        &self,
        records: &[Record],
        resolver: &ConflictResolver,
    ) -> Result<usize, StoreError> {
        for record in records {
            validate_key(record)?;
            self.ensure_table(&record.collection).await?;
        }

        let mut tx = self.pool.begin().await?;
        let mut changed = 0;
        for remote in records {
            let local = match read_row(&mut tx, &remote.collection, &remote.owner, &remote.id).await? {
                Some(row) => self.decode_or_discard(&mut tx, &remote.collection, row).await?,
                None => None,
            };

            let take_remote = match &local {
                Some(local) => local != remote && resolver.pick(local, remote) == Winner::Remote,
                None => true,
            };
            if take_remote {
                write_row(&mut tx, remote).await?;
                changed += 1;
            }
        }
        tx.commit().await?;
        Ok(changed)
    }

    /// Marks a live record deleted with a fresh timestamp and returns the
    /// tombstone. Missing or already deleted records yield `None`.
    pub async fn tombstone(
        &self,
        collection: &str,
        owner: &str,
        id: &str,
    ) -> Result<Option<Record>, StoreError> {
        self.ensure_table(collection).await?;

        let mut tx = self.pool.begin().await?;
        let existing = match read_row(&mut tx, collection, owner, id).await? {
            Some(row) => self.decode_or_discard(&mut tx, collection, row).await?,
            None => None,
        };

        let mut record = match existing {
            Some(record) if !record.deleted => record,
            _ => {
                tx.commit().await?;
                return Ok(None);
            }
        };
        record.deleted = true;
        record.updated_at = next_timestamp(record.updated_at);

        write_row(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(Some(record))
    }

    /// Hard delete, bypassing tombstones.
    pub async fn remove(&self, collection: &str, owner: &str, id: &str) -> Result<bool, StoreError> {
        self.ensure_table(collection).await?;
        let mut conn = self.pool.acquire().await?;
        Ok(delete_row(&mut conn, collection, owner, id).await?)
    }

    /// Deletes tombstones older than `grace` whose deletion no longer waits
    /// in the outbox. Returns the number of purged records.
    pub async fn purge_tombstones_older_than(&self, grace: Duration) -> Result<u64, StoreError> {
        let cutoff = timestamp_key(now() - grace);
        let mut purged = 0;

        for collection in self.registered_collections().await? {
            let table = table_name(&collection);
            let result = sqlx::query(&format!(
                r#"
                DELETE FROM {table}
                WHERE deleted = 1
                  AND updated_at <= ?
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox
                      WHERE outbox.collection = ?
                        AND outbox.owner = {table}.owner
                        AND outbox.record_id = {table}.id
                  )
                "#
            ))
            .bind(&cutoff)
            .bind(&collection)
            .execute(&self.pool)
            .await?;
            purged += result.rows_affected();
        }

        if purged > 0 {
            tracing::debug!(purged, "Purged local tombstones");
        }
        Ok(purged)
    }

    async fn registered_collections(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM collections ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(name,)| name)
            .filter(|name| validate_collection_name(name).is_ok())
            .collect())
    }

    /// Collections in which `owner` has at least one local record.
    pub async fn known_collections(&self, owner: &str) -> Result<Vec<String>, StoreError> {
        let mut known = Vec::new();
        for collection in self.registered_collections().await? {
            let (present,): (bool,) = sqlx::query_as(&format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE owner = ?)",
                table_name(&collection)
            ))
            .bind(owner)
            .fetch_one(&self.pool)
            .await?;
            if present {
                known.push(collection);
            }
        }
        Ok(known)
    }

    /// Returns and clears the scopes in which unreadable rows were dropped.
    pub fn take_corrupted(&self) -> Vec<(String, String)> {
        self.lock_corrupted().drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_pool, OutboxQueue};
    use lifesync_core::OutboxEntry;
    use serde_json::json;

    fn task(id: &str, title: &str) -> Record {
        Record::new("tasks", "u1", json!({ "title": title }).as_object().cloned().unwrap())
            .with_id(id)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (_dir, pool) = test_pool().await;
        let store = LocalStore::new(pool);

        let record = task("t1", "Buy milk");
        assert!(store.put(&record).await.unwrap());

        let loaded = store.get("tasks", "u1", "t1").await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.get("tasks", "u2", "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_is_last_write_wins() {
        let (_dir, pool) = test_pool().await;
        let store = LocalStore::new(pool);

        let newer = task("t1", "new");
        store.put(&newer).await.unwrap();

        let older = task("t1", "old").with_updated_at(newer.updated_at - Duration::seconds(1));
        assert!(!store.put(&older).await.unwrap());

        let tie = task("t1", "tie").with_updated_at(newer.updated_at);
        assert!(store.put(&tie).await.unwrap());

        let loaded = store.get("tasks", "u1", "t1").await.unwrap().unwrap();
        assert_eq!(loaded.payload["title"], json!("tie"));
    }

    #[tokio::test]
    async fn test_scan_excludes_tombstones_and_filters() {
        let (_dir, pool) = test_pool().await;
        let store = LocalStore::new(pool);

        store.put(&task("t1", "a")).await.unwrap();
        store.put(&task("t2", "b")).await.unwrap();
        store.put(&task("t3", "c")).await.unwrap();
        store.tombstone("tasks", "u1", "t2").await.unwrap();

        let all = store.scan("tasks", "u1", None).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t3"]);

        let filter = Filter::new().where_eq("title", "c");
        let filtered = store.scan("tasks", "u1", Some(&filter)).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "t3");
    }

    #[tokio::test]
    async fn test_tombstone_bumps_timestamp() {
        let (_dir, pool) = test_pool().await;
        let store = LocalStore::new(pool);

        let record = task("t1", "a");
        store.put(&record).await.unwrap();

        let tombstone = store.tombstone("tasks", "u1", "t1").await.unwrap().unwrap();
        assert!(tombstone.deleted);
        assert!(tombstone.updated_at > record.updated_at);

        assert!(store.tombstone("tasks", "u1", "t1").await.unwrap().is_none());
        assert!(store.tombstone("tasks", "u1", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_keeps_local_tombstone_on_tie() {
        let (_dir, pool) = test_pool().await;
        let store = LocalStore::new(pool);

        store.put(&task("t1", "a")).await.unwrap();
        let tombstone = store.tombstone("tasks", "u1", "t1").await.unwrap().unwrap();

        let remote_live = task("t1", "a").with_updated_at(tombstone.updated_at);
        let remote_new = task("t2", "b");
        let changed = store
            .merge(&[remote_live, remote_new], &ConflictResolver::new())
            .await
            .unwrap();

        assert_eq!(changed, 1);
        assert!(store.get("tasks", "u1", "t1").await.unwrap().unwrap().deleted);
        assert!(store.get("tasks", "u1", "t2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_skips_tombstones_still_in_outbox() {
        let (_dir, pool) = test_pool().await;
        let store = LocalStore::new(pool.clone());
        let outbox = OutboxQueue::new(pool);

        store.put(&task("t1", "a")).await.unwrap();
        store.put(&task("t2", "b")).await.unwrap();
        store.tombstone("tasks", "u1", "t1").await.unwrap();
        let pending = store.tombstone("tasks", "u1", "t2").await.unwrap().unwrap();
        outbox
            .enqueue(OutboxEntry::delete("tasks", "u1", "t2", pending.updated_at))
            .await
            .unwrap();

        // Not old enough yet.
        assert_eq!(
            store.purge_tombstones_older_than(Duration::hours(1)).await.unwrap(),
            0
        );

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(
            store.purge_tombstones_older_than(Duration::zero()).await.unwrap(),
            1
        );
        assert!(store.get("tasks", "u1", "t1").await.unwrap().is_none());
        assert!(store.get("tasks", "u1", "t2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unreadable_row_is_dropped_and_reported() {
        let (_dir, pool) = test_pool().await;
        let store = LocalStore::new(pool.clone());

        store.put(&task("t1", "a")).await.unwrap();
        sqlx::query("UPDATE records_tasks SET payload = 'not json' WHERE id = 't1'")
            .execute(&pool)
            .await
            .unwrap();

        assert!(store.scan("tasks", "u1", None).await.unwrap().is_empty());
        assert_eq!(
            store.take_corrupted(),
            vec![("tasks".to_string(), "u1".to_string())]
        );
        assert!(store.take_corrupted().is_empty());
        assert!(store.get("tasks", "u1", "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_known_collections_per_owner() {
        let (_dir, pool) = test_pool().await;
        let store = LocalStore::new(pool);

        store.put(&task("t1", "a")).await.unwrap();
        let note = Record::new("notes", "u2", json!({"title": "n"}).as_object().cloned().unwrap());
        store.put(&note).await.unwrap();

        assert_eq!(store.known_collections("u1").await.unwrap(), vec!["tasks"]);
        assert_eq!(store.known_collections("u2").await.unwrap(), vec!["notes"]);
    }

    #[tokio::test]
    async fn test_invalid_collection_name_is_rejected() {
        let (_dir, pool) = test_pool().await;
        let store = LocalStore::new(pool);

        let err = store.scan("tasks; DROP TABLE outbox", "u1", None).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }
}
