use chrono::{DateTime, Utc};
use lifesync_core::models::timestamp_key;
use lifesync_core::SyncCursor;
use sqlx::SqlitePool;

use super::{parse_timestamp, StoreError};

/// Per-(collection, owner) pull watermarks.
pub struct CursorStore {
    pool: SqlitePool,
}

impl CursorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(
        &self,
        collection: &str,
        owner: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT last_synced_at FROM sync_cursors WHERE collection = ? AND owner = ?",
        )
        .bind(collection)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(ts,)| parse_timestamp(&ts)))
    }

    /// Moves the watermark forward. Never moves it back.
    pub async fn advance(
        &self,
        collection: &str,
        owner: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (collection, owner, last_synced_at)
            VALUES (?, ?, ?)
            ON CONFLICT(collection, owner) DO UPDATE SET
                last_synced_at = excluded.last_synced_at
            WHERE excluded.last_synced_at > sync_cursors.last_synced_at
            "#,
        )
        .bind(collection)
        .bind(owner)
        .bind(timestamp_key(synced_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset(&self, collection: &str, owner: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_cursors WHERE collection = ? AND owner = ?")
            .bind(collection)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn reset_owner(&self, owner: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sync_cursors WHERE owner = ?")
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_for_owner(&self, owner: &str) -> Result<Vec<SyncCursor>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT collection, last_synced_at FROM sync_cursors WHERE owner = ? ORDER BY collection",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(collection, ts)| {
                parse_timestamp(&ts).map(|at| SyncCursor::new(collection, owner.to_string(), at))
            })
            .collect())
    }
}
