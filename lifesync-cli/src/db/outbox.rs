//! Durable queue of writes waiting for the remote.

use std::collections::{HashMap, HashSet};

use lifesync_core::models::timestamp_key;
use lifesync_core::{Operation, OutboxEntry, OutboxStatus, Payload};
use sqlx::{SqliteConnection, SqlitePool};

use super::{parse_timestamp, StoreError};

const SELECT_ENTRY: &str = r#"
    SELECT sequence, collection, owner, record_id, operation, payload,
           record_updated_at, created_at, retry_count, last_error, status
    FROM outbox
"#;

#[derive(sqlx::FromRow)]
struct OutboxRow {
    sequence: i64,
    collection: String,
    owner: String,
    record_id: String,
    operation: String,
    payload: Option<String>,
    record_updated_at: String,
    created_at: String,
    retry_count: i64,
    last_error: Option<String>,
    status: String,
}

impl OutboxRow {
    fn into_entry(self) -> Option<OutboxEntry> {
        let payload = match self.payload {
            Some(text) => Some(serde_json::from_str::<Payload>(&text).ok()?),
            None => None,
        };
        Some(OutboxEntry {
            sequence: self.sequence as u64,
            collection: self.collection,
            owner: self.owner,
            id: self.record_id,
            operation: Operation::parse(&self.operation)?,
            payload,
            record_updated_at: parse_timestamp(&self.record_updated_at)?,
            created_at: parse_timestamp(&self.created_at)?,
            retry_count: self.retry_count.max(0) as u32,
            last_error: self.last_error,
            status: OutboxStatus::parse(&self.status)?,
        })
    }
}

fn decode_rows(rows: Vec<OutboxRow>) -> Vec<OutboxEntry> {
    rows.into_iter()
        .filter_map(|row| {
            let sequence = row.sequence;
            let entry = row.into_entry();
            if entry.is_none() {
                tracing::warn!(sequence, "Skipping unreadable outbox entry");
            }
            entry
        })
        .collect()
}

async fn entries_for_record(
    conn: &mut SqliteConnection,
    entry: &OutboxEntry,
) -> Result<Vec<OutboxEntry>, sqlx::Error> {
    let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
        "{} WHERE collection = ? AND owner = ? AND record_id = ? ORDER BY sequence",
        SELECT_ENTRY
    ))
    .bind(&entry.collection)
    .bind(&entry.owner)
    .bind(&entry.id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(decode_rows(rows))
}

pub struct OutboxQueue {
    pool: SqlitePool,
    coalesce_updates: bool,
}

impl OutboxQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            coalesce_updates: true,
        }
    }

    /// With coalescing off every update is sent as its own write.
    pub fn with_coalescing(mut self, coalesce_updates: bool) -> Self {
        self.coalesce_updates = coalesce_updates;
        self
    }

    /// Adds a write to the queue, folding it into pending entries for the
    /// same record where possible.
    ///
    /// - An update following a pending update merges into it and keeps its
    ///   sequence.
    /// - A delete of a record whose insert is still pending cancels all of
    ///   that record's pending entries and enqueues nothing.
    /// - Any other delete drops pending updates and is appended.
    ///
    /// Entries that are in flight or dead are never touched. Returns the
    /// sequence now carrying the write, or `None` if it was cancelled out.
    pub async fn enqueue(&self, entry: OutboxEntry) -> Result<Option<u64>, StoreError> {
        let mut tx = self.pool.begin().await?;

        match entry.operation {
            Operation::Update if self.coalesce_updates => {
                let existing = entries_for_record(&mut tx, &entry).await?;
                if let Some(last) = existing.last().filter(|last| {
                    last.status == OutboxStatus::Pending && last.operation == Operation::Update
                }) {
                    let mut merged = last.payload.clone().unwrap_or_default();
                    for (key, value) in entry.payload.iter().flatten() {
                        merged.insert(key.clone(), value.clone());
                    }
                    sqlx::query(
                        "UPDATE outbox SET payload = ?, record_updated_at = ? WHERE sequence = ?",
                    )
                    .bind(serde_json::to_string(&merged)?)
                    .bind(timestamp_key(entry.record_updated_at))
                    .bind(last.sequence as i64)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    return Ok(Some(last.sequence));
                }
            }
            Operation::Delete => {
                let existing = entries_for_record(&mut tx, &entry).await?;
                let insert_pending = existing.iter().any(|e| {
                    e.status == OutboxStatus::Pending && e.operation == Operation::Insert
                });
                let superseded = if insert_pending {
                    "DELETE FROM outbox WHERE collection = ? AND owner = ? AND record_id = ? AND status = 'pending'"
                } else {
                    "DELETE FROM outbox WHERE collection = ? AND owner = ? AND record_id = ? AND status = 'pending' AND operation = 'update'"
                };
                sqlx::query(superseded)
                    .bind(&entry.collection)
                    .bind(&entry.owner)
                    .bind(&entry.id)
                    .execute(&mut *tx)
                    .await?;
                if insert_pending {
                    tx.commit().await?;
                    return Ok(None);
                }
            }
            _ => {}
        }

        let payload = match &entry.payload {
            Some(payload) => Some(serde_json::to_string(payload)?),
            None => None,
        };
        let result = sqlx::query(
            r#"
            INSERT INTO outbox (collection, owner, record_id, operation, payload,
                                record_updated_at, created_at, retry_count, last_error, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, NULL, 'pending')
            "#,
        )
        .bind(&entry.collection)
        .bind(&entry.owner)
        .bind(&entry.id)
        .bind(entry.operation.as_str())
        .bind(&payload)
        .bind(timestamp_key(entry.record_updated_at))
        .bind(timestamp_key(entry.created_at))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Some(result.last_insert_rowid() as u64))
    }

    pub async fn get(&self, sequence: u64) -> Result<Option<OutboxEntry>, StoreError> {
        let row: Option<OutboxRow> = sqlx::query_as(&format!("{} WHERE sequence = ?", SELECT_ENTRY))
            .bind(sequence as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(OutboxRow::into_entry))
    }

    /// Pending entries of (collection, owner) in sequence order.
    pub async fn dequeue_in_order(
        &self,
        collection: &str,
        owner: &str,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            "{} WHERE collection = ? AND owner = ? AND status = 'pending' ORDER BY sequence",
            SELECT_ENTRY
        ))
        .bind(collection)
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(decode_rows(rows))
    }

    /// Claims a pending entry for sending and returns its current contents.
    pub async fn mark_in_flight(&self, sequence: u64) -> Result<Option<OutboxEntry>, StoreError> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'in_flight' WHERE sequence = ? AND status = 'pending'",
        )
        .bind(sequence as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(sequence).await
    }

    /// Drops an acknowledged entry.
    pub async fn remove(&self, sequence: u64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM outbox WHERE sequence = ?")
            .bind(sequence as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records a rejection and returns the entry to pending. Returns the new
    /// retry count.
    pub async fn mark_failed(&self, sequence: u64, error: &str) -> Result<Option<u32>, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE outbox
            SET retry_count = retry_count + 1, last_error = ?, status = 'pending'
            WHERE sequence = ?
            RETURNING retry_count
            "#,
        )
        .bind(error)
        .bind(sequence as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(count,)| count.max(0) as u32))
    }

    /// Returns an in-flight entry to pending after a transient failure,
    /// without counting it as a rejection.
    pub async fn release(&self, sequence: u64, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox SET status = 'pending', last_error = ? WHERE sequence = ? AND status = 'in_flight'",
        )
        .bind(error)
        .bind(sequence as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn dead_letter(&self, sequence: u64, error: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbox SET status = 'dead', last_error = ? WHERE sequence = ?")
            .bind(error)
            .bind(sequence as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Moves a dead entry back to pending with a fresh retry budget.
    pub async fn requeue(&self, sequence: u64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'pending', retry_count = 0, last_error = NULL WHERE sequence = ? AND status = 'dead'",
        )
        .bind(sequence as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes a dead entry.
    pub async fn discard(&self, sequence: u64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM outbox WHERE sequence = ? AND status = 'dead'")
            .bind(sequence as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Entries left in flight by an interrupted process go back to pending.
    pub async fn recover_in_flight(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE outbox SET status = 'pending' WHERE status = 'in_flight'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Unacknowledged, non-dead entries of an owner across collections.
    pub async fn pending_for_owner(&self, owner: &str) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            "{} WHERE owner = ? AND status IN ('pending', 'in_flight') ORDER BY sequence",
            SELECT_ENTRY
        ))
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(decode_rows(rows))
    }

    pub async fn dead_for_owner(&self, owner: &str) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            "{} WHERE owner = ? AND status = 'dead' ORDER BY sequence",
            SELECT_ENTRY
        ))
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(decode_rows(rows))
    }

    /// True if (collection, owner) has entries waiting or being sent.
    pub async fn has_pending(&self, collection: &str, owner: &str) -> Result<bool, StoreError> {
        let (pending,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM outbox WHERE collection = ? AND owner = ? AND status IN ('pending', 'in_flight'))",
        )
        .bind(collection)
        .bind(owner)
        .fetch_one(&self.pool)
        .await?;
        Ok(pending)
    }

    /// Lowest dead sequence per record id of (collection, owner).
    pub async fn dead_sequences(
        &self,
        collection: &str,
        owner: &str,
    ) -> Result<HashMap<String, u64>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT record_id, MIN(sequence) FROM outbox
            WHERE collection = ? AND owner = ? AND status = 'dead'
            GROUP BY record_id
            "#,
        )
        .bind(collection)
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, sequence)| (id, sequence as u64))
            .collect())
    }

    /// Owners with entries waiting or being sent, in any collection.
    pub async fn owners_with_pending(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT owner FROM outbox WHERE status IN ('pending', 'in_flight') ORDER BY owner",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(owner,)| owner).collect())
    }

    /// Ids of (collection, owner) with any unacknowledged entry.
    pub async fn unacknowledged_ids(
        &self,
        collection: &str,
        owner: &str,
    ) -> Result<HashSet<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT record_id FROM outbox WHERE collection = ? AND owner = ?",
        )
        .bind(collection)
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Points every entry of a record at a new id.
    pub async fn rename_id(
        &self,
        collection: &str,
        owner: &str,
        old_id: &str,
        new_id: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE outbox SET record_id = ? WHERE collection = ? AND owner = ? AND record_id = ?",
        )
        .bind(new_id)
        .bind(collection)
        .bind(owner)
        .bind(old_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Collections with any entry for `owner`.
    pub async fn collections_for_owner(&self, owner: &str) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT collection FROM outbox WHERE owner = ? ORDER BY collection",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(c,)| c).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use lifesync_core::models::now;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn insert(id: &str) -> OutboxEntry {
        OutboxEntry::insert("tasks", "u1", id, payload(json!({"title": id})), now())
    }

    fn update(id: &str, partial: serde_json::Value) -> OutboxEntry {
        OutboxEntry::update("tasks", "u1", id, payload(partial), now())
    }

    #[tokio::test]
    async fn test_updates_coalesce_into_one_entry() {
        let (_dir, pool) = test_pool().await;
        let outbox = OutboxQueue::new(pool);

        let first = outbox.enqueue(update("t1", json!({"title": "a"}))).await.unwrap();
        let second = outbox
            .enqueue(update("t1", json!({"done": true})))
            .await
            .unwrap();
        assert_eq!(first, second);

        let entries = outbox.dequeue_in_order("tasks", "u1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].payload,
            Some(payload(json!({"title": "a", "done": true})))
        );
    }

    #[tokio::test]
    async fn test_update_does_not_merge_into_insert() {
        let (_dir, pool) = test_pool().await;
        let outbox = OutboxQueue::new(pool);

        outbox.enqueue(insert("t1")).await.unwrap();
        outbox.enqueue(update("t1", json!({"done": true}))).await.unwrap();
        outbox.enqueue(update("t1", json!({"notes": "x"}))).await.unwrap();

        let ops: Vec<Operation> = outbox
            .dequeue_in_order("tasks", "u1")
            .await
            .unwrap()
            .iter()
            .map(|e| e.operation)
            .collect();
        assert_eq!(ops, vec![Operation::Insert, Operation::Update]);
    }

    #[tokio::test]
    async fn test_coalescing_can_be_disabled() {
        let (_dir, pool) = test_pool().await;
        let outbox = OutboxQueue::new(pool).with_coalescing(false);

        outbox.enqueue(update("t1", json!({"a": 1}))).await.unwrap();
        outbox.enqueue(update("t1", json!({"b": 2}))).await.unwrap();

        assert_eq!(outbox.dequeue_in_order("tasks", "u1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_cancels_pending_insert() {
        let (_dir, pool) = test_pool().await;
        let outbox = OutboxQueue::new(pool);

        outbox.enqueue(insert("t1")).await.unwrap();
        outbox.enqueue(update("t1", json!({"done": true}))).await.unwrap();
        outbox.enqueue(insert("t2")).await.unwrap();

        let result = outbox
            .enqueue(OutboxEntry::delete("tasks", "u1", "t1", now()))
            .await
            .unwrap();
        assert!(result.is_none());

        let entries = outbox.dequeue_in_order("tasks", "u1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "t2");
    }

    #[tokio::test]
    async fn test_delete_supersedes_pending_updates() {
        let (_dir, pool) = test_pool().await;
        let outbox = OutboxQueue::new(pool);

        outbox.enqueue(update("t1", json!({"done": true}))).await.unwrap();
        outbox
            .enqueue(OutboxEntry::delete("tasks", "u1", "t1", now()))
            .await
            .unwrap();

        let entries = outbox.dequeue_in_order("tasks", "u1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, Operation::Delete);
    }

    #[tokio::test]
    async fn test_in_flight_entries_are_left_alone() {
        let (_dir, pool) = test_pool().await;
        let outbox = OutboxQueue::new(pool);

        let seq = outbox.enqueue(insert("t1")).await.unwrap().unwrap();
        let claimed = outbox.mark_in_flight(seq).await.unwrap().unwrap();
        assert_eq!(claimed.status, OutboxStatus::InFlight);
        assert!(outbox.mark_in_flight(seq).await.unwrap().is_none());

        let delete = outbox
            .enqueue(OutboxEntry::delete("tasks", "u1", "t1", now()))
            .await
            .unwrap();
        assert!(delete.is_some());
        assert!(outbox.get(seq).await.unwrap().is_some());
        assert!(outbox.has_pending("tasks", "u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_failures_dead_letters_and_requeue() {
        let (_dir, pool) = test_pool().await;
        let outbox = OutboxQueue::new(pool);

        let seq = outbox.enqueue(insert("t1")).await.unwrap().unwrap();
        outbox.mark_in_flight(seq).await.unwrap();
        assert_eq!(outbox.mark_failed(seq, "422").await.unwrap(), Some(1));
        assert_eq!(outbox.mark_failed(seq, "422").await.unwrap(), Some(2));

        outbox.dead_letter(seq, "gave up").await.unwrap();
        assert!(outbox.dequeue_in_order("tasks", "u1").await.unwrap().is_empty());
        assert!(!outbox.has_pending("tasks", "u1").await.unwrap());

        let dead = outbox.dead_for_owner("u1").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("gave up"));

        assert!(outbox.requeue(seq).await.unwrap());
        let entry = outbox.get(seq).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.retry_count, 0);

        assert!(!outbox.discard(seq).await.unwrap());
        outbox.dead_letter(seq, "again").await.unwrap();
        assert!(outbox.discard(seq).await.unwrap());
        assert!(outbox.get(seq).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_in_flight_and_rename() {
        let (_dir, pool) = test_pool().await;
        let outbox = OutboxQueue::new(pool);

        let seq = outbox.enqueue(insert("local-1")).await.unwrap().unwrap();
        outbox.mark_in_flight(seq).await.unwrap();
        assert_eq!(outbox.recover_in_flight().await.unwrap(), 1);
        assert_eq!(
            outbox.get(seq).await.unwrap().unwrap().status,
            OutboxStatus::Pending
        );

        outbox
            .rename_id("tasks", "u1", "local-1", "server-1")
            .await
            .unwrap();
        let ids = outbox.unacknowledged_ids("tasks", "u1").await.unwrap();
        assert!(ids.contains("server-1"));
        assert_eq!(outbox.collections_for_owner("u1").await.unwrap(), vec!["tasks"]);
    }

    #[tokio::test]
    async fn test_dead_sequences_and_owners_with_pending() {
        let (_dir, pool) = test_pool().await;
        let outbox = OutboxQueue::new(pool).with_coalescing(false);

        let first = outbox.enqueue(insert("t1")).await.unwrap().unwrap();
        let update = OutboxEntry::update("tasks", "u1", "t1", payload(json!({"done": true})), now());
        outbox.enqueue(update).await.unwrap().unwrap();
        outbox
            .enqueue(OutboxEntry::insert("notes", "u2", "n1", payload(json!({"body": "x"})), now()))
            .await
            .unwrap();

        assert!(outbox.dead_sequences("tasks", "u1").await.unwrap().is_empty());
        outbox.dead_letter(first, "refused").await.unwrap();

        let dead = outbox.dead_sequences("tasks", "u1").await.unwrap();
        assert_eq!(dead.get("t1"), Some(&first));
        assert_eq!(
            outbox.owners_with_pending().await.unwrap(),
            vec!["u1".to_string(), "u2".to_string()]
        );
    }
}
