//! Server-side record storage.
//!
//! All records live in one SQLite table keyed by (collection, owner, id).
//! Each stored version carries `received_at`, a strictly increasing server
//! clock value. Pulls filter on it, so a client cursor taken from a query's
//! `synced_at` never skips a write that lands later.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lifesync_core::collections::validate_scope;
use lifesync_core::models::{next_timestamp, now, timestamp_key};
use lifesync_core::sync::{apply_write, WriteRejection};
use lifesync_core::{apply_filter, Payload, QueryResponse, Record, RemoteQuery, ValidationError, WriteOp};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerStorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Rejected(#[from] WriteRejection),

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to create data directory '{}': {}", .0.display(), .1)]
    CreateDir(PathBuf, std::io::Error),
}

#[derive(FromRow)]
struct RecordRow {
    collection: String,
    owner: String,
    id: String,
    payload: String,
    updated_at: String,
    deleted: bool,
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl RecordRow {
    fn decode(&self) -> Option<Record> {
        Some(Record {
            collection: self.collection.clone(),
            owner: self.owner.clone(),
            id: self.id.clone(),
            payload: serde_json::from_str::<Payload>(&self.payload).ok()?,
            updated_at: parse_timestamp(&self.updated_at)?,
            deleted: self.deleted,
        })
    }
}

const SELECT_RECORD: &str =
    "SELECT collection, owner, id, payload, updated_at, deleted FROM records";

pub struct ServerStorage {
    pool: SqlitePool,
    /// Serializes writes with each other and with the clock reads of queries.
    write_lock: tokio::sync::Mutex<()>,
    clock: Mutex<Option<DateTime<Utc>>>,
}

impl ServerStorage {
    /// Opens (creating if needed) the database at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self, ServerStorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ServerStorageError::CreateDir(parent.to_path_buf(), e))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        // Resume the clock after the newest stored version.
        let (latest,): (Option<String>,) = sqlx::query_as("SELECT MAX(received_at) FROM records")
            .fetch_one(&pool)
            .await?;

        Ok(Self {
            pool,
            write_lock: tokio::sync::Mutex::new(()),
            clock: Mutex::new(latest.as_deref().and_then(parse_timestamp)),
        })
    }

    /// Next server clock value, strictly after every previous one.
    fn tick(&self) -> DateTime<Utc> {
        let mut clock = self.clock.lock().unwrap_or_else(|p| p.into_inner());
        let ts = match *clock {
            Some(last) => next_timestamp(last),
            None => now(),
        };
        *clock = Some(ts);
        ts
    }

    /// Scoped read. `synced_at` is taken under the write lock, so every
    /// later write is received after it.
    pub async fn query(
        &self,
        collection: &str,
        owner: &str,
        query: &RemoteQuery,
    ) -> Result<QueryResponse, ServerStorageError> {
        validate_scope(collection, owner)?;

        let (synced_at, rows) = {
            let _guard = self.write_lock.lock().await;
            let synced_at = self.tick();

            let mut sql = format!("{} WHERE collection = ? AND owner = ?", SELECT_RECORD);
            if !query.include_deleted {
                sql.push_str(" AND deleted = 0");
            }
            if query.since.is_some() {
                sql.push_str(" AND received_at > ?");
            }
            let mut statement = sqlx::query_as::<_, RecordRow>(&sql).bind(collection).bind(owner);
            if let Some(since) = query.since {
                statement = statement.bind(timestamp_key(since));
            }
            (synced_at, statement.fetch_all(&self.pool).await?)
        };

        let records = rows
            .iter()
            .filter_map(|row| {
                let record = row.decode();
                if record.is_none() {
                    tracing::error!(collection, owner, id = %row.id, "Stored record is unreadable");
                }
                record
            })
            .collect();

        Ok(QueryResponse {
            records: apply_filter(query.filter.as_ref(), records),
            synced_at,
        })
    }

    /// Applies one write and returns the stored record.
    pub async fn write(
        &self,
        collection: &str,
        owner: &str,
        op: &WriteOp,
    ) -> Result<Record, ServerStorageError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let existing = read_record(&mut tx, collection, owner, op.id()).await?;
        let unchanged = existing.clone();
        let record = apply_write(collection, owner, existing, op)?;

        // Replays that change nothing keep their received_at, so pulls do
        // not deliver them again.
        if unchanged.as_ref() != Some(&record) {
            let received_at = self.tick();
            write_record(&mut tx, &record, received_at).await?;
        }
        tx.commit().await?;

        tracing::debug!(collection, owner, id = %record.id, op = %op.operation(), "Applied write");
        Ok(record)
    }

    /// Drops tombstones older than `grace`. Returns how many were removed.
    pub async fn purge_tombstones_older_than(
        &self,
        grace: chrono::Duration,
    ) -> Result<u64, ServerStorageError> {
        let cutoff = timestamp_key(now() - grace);
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM records WHERE deleted = 1 AND updated_at <= ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Live and deleted record counts per (collection, owner).
    pub async fn stats(&self) -> Result<Vec<(String, String, i64, i64)>, ServerStorageError> {
        let rows = sqlx::query_as(
            r#"
            SELECT collection, owner,
                   SUM(CASE WHEN deleted = 0 THEN 1 ELSE 0 END),
                   SUM(CASE WHEN deleted = 1 THEN 1 ELSE 0 END)
            FROM records
            GROUP BY collection, owner
            ORDER BY owner, collection
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

async fn read_record(
    conn: &mut SqliteConnection,
    collection: &str,
    owner: &str,
    id: &str,
) -> Result<Option<Record>, ServerStorageError> {
    let row: Option<RecordRow> = sqlx::query_as(&format!(
        "{} WHERE collection = ? AND owner = ? AND id = ?",
        SELECT_RECORD
    ))
    .bind(collection)
    .bind(owner)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.and_then(|row| {
        let record = row.decode();
        if record.is_none() {
            // Treated as absent; the incoming write replaces it.
            tracing::error!(collection, owner, id, "Stored record is unreadable");
        }
        record
    }))
}

async fn write_record(
    conn: &mut SqliteConnection,
    record: &Record,
    received_at: DateTime<Utc>,
) -> Result<(), ServerStorageError> {
    sqlx::query(
        r#"
        INSERT INTO records (collection, owner, id, payload, updated_at, deleted, received_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(collection, owner, id) DO UPDATE SET
            payload = excluded.payload,
            updated_at = excluded.updated_at,
            deleted = excluded.deleted,
            received_at = excluded.received_at
        "#,
    )
    .bind(&record.collection)
    .bind(&record.owner)
    .bind(&record.id)
    .bind(serde_json::to_string(&record.payload)?)
    .bind(timestamp_key(record.updated_at))
    .bind(record.deleted)
    .bind(timestamp_key(received_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_storage() -> (tempfile::TempDir, ServerStorage) {
    let temp_dir = tempfile::tempdir().unwrap();
    let storage = ServerStorage::open(&temp_dir.path().join("server.db"))
        .await
        .unwrap();
    (temp_dir, storage)
}
