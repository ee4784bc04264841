//! The data-access facade every surface goes through.
//!
//! Reads try the remote and fall back to the local mirror. Writes land in the
//! local store first and travel to the remote through the outbox, either
//! right away when online or on the next reconciliation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use lifesync_core::collections::{validate_insert, validate_scope, validate_update};
use lifesync_core::{
    apply_filter, Collection, ConflictResolver, Filter, OutboxEntry, Payload, Record,
    RemoteClient, RemoteError, RemoteQuery, SyncCursor, ValidationError,
};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use super::connectivity::ConnectivityMonitor;
use super::locks::KeyedLocks;
use super::retry::{with_timeout, CancelFlag, RetryPolicy};
use crate::db::{CursorStore, LocalStore, OutboxQueue, StoreError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("No dead-lettered outbox entry #{0}")]
    NoDeadLetter(u64),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),
}

/// Tuning knobs, usually built from the `sync` config section.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Deadline for every remote call.
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    /// Rejections after which an entry is dead-lettered.
    pub dead_letter_after: u32,
    pub tombstone_grace: chrono::Duration,
    pub coalesce_updates: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            dead_letter_after: 5,
            tombstone_grace: chrono::Duration::hours(72),
            coalesce_updates: true,
        }
    }
}

/// What one reconciliation did for one collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionReport {
    pub collection: String,
    pub pushed: usize,
    pub rejected: usize,
    pub dead_lettered: Vec<u64>,
    /// Entries left queued behind a refused write for the same record.
    pub held: usize,
    pub pulled: usize,
    /// Delivery stopped on a transient failure; the rest waits in the outbox.
    pub stalled: bool,
    pub cancelled: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub owner: String,
    /// The remote could not be reached; nothing was attempted.
    pub offline: bool,
    pub collections: Vec<CollectionReport>,
}

impl ReconcileReport {
    pub fn pushed(&self) -> usize {
        self.collections.iter().map(|c| c.pushed).sum()
    }

    pub fn pulled(&self) -> usize {
        self.collections.iter().map(|c| c.pulled).sum()
    }

    pub fn dead_lettered(&self) -> Vec<u64> {
        self.collections
            .iter()
            .flat_map(|c| c.dead_lettered.iter().copied())
            .collect()
    }

    /// Entries waiting behind a refused write for the same record.
    pub fn held(&self) -> usize {
        self.collections.iter().map(|c| c.held).sum()
    }

    /// True if every collection was drained and pulled.
    pub fn is_complete(&self) -> bool {
        !self.offline
            && self
                .collections
                .iter()
                .all(|c| !c.stalled && !c.cancelled && c.error.is_none())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub online: bool,
    pub last_transition_at: DateTime<Utc>,
    pub pending: usize,
    pub dead_letters: Vec<OutboxEntry>,
    pub cursors: Vec<SyncCursor>,
}

/// Result of handing one outbox entry to the remote.
enum Delivery {
    /// Carries the mirrored record, unless the echo was ignored.
    Acknowledged(Option<Record>),
    Rejected,
    DeadLettered,
    Failed(RemoteError),
}

pub struct SyncEngine {
    local: LocalStore,
    outbox: OutboxQueue,
    cursors: CursorStore,
    remote: Arc<dyn RemoteClient>,
    monitor: Arc<ConnectivityMonitor>,
    resolver: ConflictResolver,
    settings: EngineSettings,
    /// Held for single local mutations only.
    mutations: KeyedLocks,
    /// Held across drains, pulls and direct writes of one scope.
    sequencers: KeyedLocks,
}

impl SyncEngine {
    /// Builds the engine over an initialised database. Entries left in
    /// flight by a previous process are returned to pending.
    pub async fn open(
        pool: SqlitePool,
        remote: Arc<dyn RemoteClient>,
        monitor: Arc<ConnectivityMonitor>,
        settings: EngineSettings,
    ) -> Result<Self, EngineError> {
        let outbox = OutboxQueue::new(pool.clone()).with_coalescing(settings.coalesce_updates);
        let recovered = outbox.recover_in_flight().await?;
        if recovered > 0 {
            tracing::info!(recovered, "Returned interrupted outbox entries to pending");
        }

        Ok(Self {
            local: LocalStore::new(pool.clone()),
            outbox,
            cursors: CursorStore::new(pool),
            remote,
            monitor,
            resolver: ConflictResolver::new(),
            settings,
            mutations: KeyedLocks::new(),
            sequencers: KeyedLocks::new(),
        })
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn connection_status(&self) -> bool {
        self.monitor.is_online()
    }

    async fn remote_call<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        with_timeout(self.settings.call_timeout, call).await
    }

    /// Reads records, from the remote when possible.
    ///
    /// Never fails for connectivity reasons. Online results include the
    /// local version of every record with unacknowledged writes.
    pub async fn fetch(
        &self,
        collection: &str,
        owner: &str,
        filter: Option<&Filter>,
    ) -> Result<Vec<Record>, EngineError> {
        validate_scope(collection, owner)?;

        if self.connection_status() {
            let query = RemoteQuery::filtered(filter);
            match self.remote_call(self.remote.query(collection, owner, &query)).await {
                Ok(response) => {
                    let records: Vec<Record> = response
                        .records
                        .into_iter()
                        .filter(|r| r.collection == collection && r.owner == owner)
                        .collect();
                    {
                        let _guard = self.mutations.lock(collection, owner).await;
                        self.local.merge(&records, &self.resolver).await?;
                    }
                    return self.overlay_unacknowledged(collection, owner, filter, records).await;
                }
                Err(e) => {
                    tracing::warn!(collection, owner, "Remote read failed, using local copy: {}", e);
                }
            }
        }

        let records = self.local.scan(collection, owner, filter).await?;
        self.reset_corrupted_cursors().await?;
        Ok(records)
    }

    async fn overlay_unacknowledged(
        &self,
        collection: &str,
        owner: &str,
        filter: Option<&Filter>,
        mut records: Vec<Record>,
    ) -> Result<Vec<Record>, EngineError> {
        let ids = self.outbox.unacknowledged_ids(collection, owner).await?;
        if ids.is_empty() {
            return Ok(records);
        }

        records.retain(|r| !ids.contains(&r.id));
        for id in &ids {
            if let Some(local) = self.local.get(collection, owner, id).await? {
                if !local.deleted {
                    records.push(local);
                }
            }
        }
        Ok(apply_filter(filter, records))
    }

    /// Stores a new record and returns it. The id is generated locally.
    pub async fn insert(
        &self,
        collection: &str,
        owner: &str,
        payload: Payload,
    ) -> Result<Record, EngineError> {
        validate_scope(collection, owner)?;
        validate_insert(collection, &payload)?;

        let record = Record::new(collection, owner, payload.clone());
        let sequencer = self.try_direct(collection, owner);

        let claimed = {
            let _guard = self.mutations.lock(collection, owner).await;
            self.local.put(&record).await?;
            let entry = OutboxEntry::insert(collection, owner, &record.id, payload, record.updated_at);
            self.enqueue(entry, sequencer.is_some()).await?
        };

        if let Some(entry) = claimed {
            if let Delivery::Acknowledged(Some(stored)) = self.deliver(&entry).await? {
                return Ok(stored);
            }
        }
        Ok(record)
    }

    /// Merges `partial` into a stored record.
    pub async fn update(
        &self,
        collection: &str,
        owner: &str,
        id: &str,
        partial: Payload,
    ) -> Result<(), EngineError> {
        validate_scope(collection, owner)?;
        if id.trim().is_empty() {
            return Err(ValidationError::EmptyId.into());
        }
        validate_update(collection, &partial)?;

        let sequencer = self.try_direct(collection, owner);

        let claimed = {
            let _guard = self.mutations.lock(collection, owner).await;
            let mut record = self
                .local
                .get(collection, owner, id)
                .await?
                .filter(|r| !r.deleted)
                .ok_or_else(|| EngineError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                })?;
            record.merge_payload(&partial);
            record.touch();
            self.local.put(&record).await?;

            let entry = OutboxEntry::update(collection, owner, id, partial, record.updated_at);
            self.enqueue(entry, sequencer.is_some()).await?
        };

        if let Some(entry) = claimed {
            self.deliver(&entry).await?;
        }
        Ok(())
    }

    /// Tombstones a record. Deleting an unknown record is a no-op.
    pub async fn delete(&self, collection: &str, owner: &str, id: &str) -> Result<(), EngineError> {
        validate_scope(collection, owner)?;
        if id.trim().is_empty() {
            return Err(ValidationError::EmptyId.into());
        }

        let sequencer = self.try_direct(collection, owner);

        let claimed = {
            let _guard = self.mutations.lock(collection, owner).await;
            let Some(tombstone) = self.local.tombstone(collection, owner, id).await? else {
                tracing::debug!(collection, owner, id, "Delete of unknown record ignored");
                return Ok(());
            };
            let entry = OutboxEntry::delete(collection, owner, id, tombstone.updated_at);
            self.enqueue(entry, sequencer.is_some()).await?
        };

        if let Some(entry) = claimed {
            self.deliver(&entry).await?;
        }
        Ok(())
    }

    /// Takes the scope's sequencer for a direct write, if online and no
    /// drain is running.
    fn try_direct(&self, collection: &str, owner: &str) -> Option<OwnedMutexGuard<()>> {
        if !self.connection_status() {
            return None;
        }
        self.sequencers.try_lock(collection, owner)
    }

    /// Queues a write. When `direct` and nothing older is waiting, the entry
    /// is claimed for immediate delivery and returned. A record with a
    /// dead-lettered write never goes direct.
    ///
    /// Must be called with the scope's mutation lock held.
    async fn enqueue(
        &self,
        entry: OutboxEntry,
        direct: bool,
    ) -> Result<Option<OutboxEntry>, EngineError> {
        let direct = direct
            && !self.outbox.has_pending(&entry.collection, &entry.owner).await?
            && !self
                .outbox
                .dead_sequences(&entry.collection, &entry.owner)
                .await?
                .contains_key(&entry.id);
        let (collection, owner, id) = (entry.collection.clone(), entry.owner.clone(), entry.id.clone());

        let Some(sequence) = self.outbox.enqueue(entry).await? else {
            tracing::debug!(%collection, %owner, %id, "Write cancelled a pending insert");
            return Ok(None);
        };
        if !direct {
            tracing::debug!(%collection, %owner, %id, sequence, "Write queued for later delivery");
            return Ok(None);
        }
        Ok(self.outbox.mark_in_flight(sequence).await?)
    }

    /// Sends one claimed entry and settles it in the outbox.
    async fn deliver(&self, entry: &OutboxEntry) -> Result<Delivery, EngineError> {
        let op = entry.to_write_op();
        let result = self
            .remote_call(self.remote.write(&entry.collection, &entry.owner, &op))
            .await;

        let _guard = self.mutations.lock(&entry.collection, &entry.owner).await;
        match result {
            Ok(stored) => {
                self.outbox.remove(entry.sequence).await?;
                let adopted = self.acknowledge(entry, stored).await?;
                Ok(Delivery::Acknowledged(adopted))
            }
            Err(e) if e.is_rejection() => {
                let message = e.to_string();
                let retries = self
                    .outbox
                    .mark_failed(entry.sequence, &message)
                    .await?
                    .unwrap_or(0);
                if retries >= self.settings.dead_letter_after {
                    self.outbox.dead_letter(entry.sequence, &message).await?;
                    tracing::warn!(
                        sequence = entry.sequence,
                        collection = %entry.collection,
                        id = %entry.id,
                        retries,
                        "Write dead-lettered: {}",
                        message
                    );
                    Ok(Delivery::DeadLettered)
                } else {
                    tracing::warn!(
                        sequence = entry.sequence,
                        collection = %entry.collection,
                        id = %entry.id,
                        retries,
                        "Remote rejected write: {}",
                        message
                    );
                    Ok(Delivery::Rejected)
                }
            }
            Err(e) => {
                tracing::debug!(sequence = entry.sequence, "Delivery failed: {}", e);
                self.outbox.release(entry.sequence, &e.to_string()).await?;
                Ok(Delivery::Failed(e))
            }
        }
    }

    /// Mirrors the remote echo of an acknowledged write, adopting a
    /// remote-assigned id if it differs from ours. Returns the echo unless it
    /// was ignored.
    ///
    /// Must be called with the scope's mutation lock held.
    async fn acknowledge(
        &self,
        entry: &OutboxEntry,
        stored: Record,
    ) -> Result<Option<Record>, EngineError> {
        if stored.collection != entry.collection || stored.owner != entry.owner {
            tracing::warn!(
                sequence = entry.sequence,
                "Remote echoed a record from another scope, ignoring it"
            );
            return Ok(None);
        }

        if stored.id != entry.id {
            tracing::info!(local = %entry.id, remote = %stored.id, "Adopting remote-assigned id");
            self.local.remove(&entry.collection, &entry.owner, &entry.id).await?;
            self.outbox
                .rename_id(&entry.collection, &entry.owner, &entry.id, &stored.id)
                .await?;
        }

        self.local.merge(std::slice::from_ref(&stored), &self.resolver).await?;
        Ok(Some(stored))
    }

    /// Collections worth reconciling for `owner`.
    async fn known_collections(&self, owner: &str) -> Result<Vec<String>, EngineError> {
        let mut collections: Vec<String> =
            Collection::ALL.iter().map(|c| c.name().to_string()).collect();
        collections.extend(self.local.known_collections(owner).await?);
        collections.extend(self.outbox.collections_for_owner(owner).await?);
        collections.sort();
        collections.dedup();
        Ok(collections)
    }

    /// Drains the outbox and pulls remote changes for every known collection
    /// of `owner`. Collections are processed concurrently.
    pub async fn reconcile_all(
        &self,
        owner: &str,
        cancel: &CancelFlag,
    ) -> Result<ReconcileReport, EngineError> {
        if owner.trim().is_empty() {
            return Err(ValidationError::EmptyOwner.into());
        }

        let mut report = ReconcileReport {
            owner: owner.to_string(),
            ..Default::default()
        };

        if !self.connection_status() && !self.monitor.probe().await {
            tracing::debug!(owner, "Skipping reconciliation while offline");
            report.offline = true;
            return Ok(report);
        }

        let collections = self.known_collections(owner).await?;
        let passes = collections
            .iter()
            .map(|collection| self.reconcile_collection(collection, owner, cancel));
        report.collections = join_all(passes).await;

        self.reset_corrupted_cursors().await?;

        tracing::info!(
            owner,
            pushed = report.pushed(),
            pulled = report.pulled(),
            dead_lettered = report.dead_lettered().len(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_collection(
        &self,
        collection: &str,
        owner: &str,
        cancel: &CancelFlag,
    ) -> CollectionReport {
        let mut report = CollectionReport {
            collection: collection.to_string(),
            ..Default::default()
        };
        if cancel.is_cancelled() {
            report.cancelled = true;
            return report;
        }

        let _sequencer = self.sequencers.lock(collection, owner).await;
        if let Err(e) = self.reconcile_locked(collection, owner, cancel, &mut report).await {
            tracing::error!(collection, owner, "Reconciliation failed: {}", e);
            report.error = Some(e.to_string());
        }
        report
    }

    async fn reconcile_locked(
        &self,
        collection: &str,
        owner: &str,
        cancel: &CancelFlag,
        report: &mut CollectionReport,
    ) -> Result<(), EngineError> {
        self.drain(collection, owner, cancel, report).await?;
        if report.stalled || report.cancelled {
            return Ok(());
        }
        self.pull(collection, owner, report).await
    }

    /// Sends pending entries of one scope in sequence order.
    ///
    /// A rejected entry holds back every later entry for the same record,
    /// as does an earlier dead-lettered one; entries for other records still
    /// go out. A transient failure is retried with backoff; once attempts run
    /// out the drain stops so nothing overtakes the stuck entry.
    async fn drain(
        &self,
        collection: &str,
        owner: &str,
        cancel: &CancelFlag,
        report: &mut CollectionReport,
    ) -> Result<(), EngineError> {
        let policy = self.settings.retry;
        let dead = self.outbox.dead_sequences(collection, owner).await?;
        let mut refused: HashSet<String> = HashSet::new();

        for queued in self.outbox.dequeue_in_order(collection, owner).await? {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(());
            }

            let behind_dead = dead.get(&queued.id).is_some_and(|s| *s < queued.sequence);
            if behind_dead || refused.contains(&queued.id) {
                tracing::debug!(
                    collection,
                    owner,
                    id = %queued.id,
                    sequence = queued.sequence,
                    "Holding write behind a refused one"
                );
                report.held += 1;
                continue;
            }

            let mut attempt = 0;
            loop {
                let claimed = {
                    let _guard = self.mutations.lock(collection, owner).await;
                    self.outbox.mark_in_flight(queued.sequence).await?
                };
                // Superseded or settled since the listing was taken.
                let Some(entry) = claimed else { break };

                match self.deliver(&entry).await? {
                    Delivery::Acknowledged(_) => report.pushed += 1,
                    Delivery::Rejected => {
                        report.rejected += 1;
                        refused.insert(entry.id.clone());
                    }
                    Delivery::DeadLettered => {
                        report.dead_lettered.push(entry.sequence);
                        refused.insert(entry.id.clone());
                    }
                    Delivery::Failed(e) => {
                        attempt += 1;
                        if attempt >= policy.max_attempts || cancel.is_cancelled() {
                            tracing::info!(
                                collection,
                                owner,
                                sequence = entry.sequence,
                                "Remote unavailable, leaving outbox for next sync: {}",
                                e
                            );
                            report.stalled = true;
                            return Ok(());
                        }
                        tokio::time::sleep(policy.delay_for(attempt - 1)).await;
                        continue;
                    }
                }
                break;
            }
        }
        Ok(())
    }

    /// Pulls changes after the cursor and merges them.
    async fn pull(
        &self,
        collection: &str,
        owner: &str,
        report: &mut CollectionReport,
    ) -> Result<(), EngineError> {
        let since = self.cursors.get(collection, owner).await?;
        let query = RemoteQuery::changes_since(since);
        let response = match self.remote_call(self.remote.query(collection, owner, &query)).await {
            Ok(response) => response,
            Err(e) => {
                tracing::info!(collection, owner, "Pull failed: {}", e);
                report.stalled = true;
                return Ok(());
            }
        };

        let records: Vec<Record> = response
            .records
            .into_iter()
            .filter(|r| r.collection == collection && r.owner == owner)
            .collect();
        {
            let _guard = self.mutations.lock(collection, owner).await;
            report.pulled = self.local.merge(&records, &self.resolver).await?;
        }
        self.cursors
            .advance(collection, owner, response.synced_at)
            .await?;
        Ok(())
    }

    /// Scopes with unreadable local rows are re-pulled from scratch.
    async fn reset_corrupted_cursors(&self) -> Result<(), EngineError> {
        for (collection, owner) in self.local.take_corrupted() {
            tracing::warn!(%collection, %owner, "Local data was unreadable, scheduling full re-pull");
            self.cursors.reset(&collection, &owner).await?;
        }
        Ok(())
    }

    /// Unacknowledged writes of `owner`, oldest first.
    pub async fn pending_writes(&self, owner: &str) -> Result<Vec<OutboxEntry>, EngineError> {
        Ok(self.outbox.pending_for_owner(owner).await?)
    }

    /// Owners with writes still waiting for the remote.
    pub async fn owners_with_pending_writes(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.outbox.owners_with_pending().await?)
    }

    pub async fn dead_letters(&self, owner: &str) -> Result<Vec<OutboxEntry>, EngineError> {
        Ok(self.outbox.dead_for_owner(owner).await?)
    }

    pub async fn retry_dead_letter(&self, sequence: u64) -> Result<(), EngineError> {
        if self.outbox.requeue(sequence).await? {
            Ok(())
        } else {
            Err(EngineError::NoDeadLetter(sequence))
        }
    }

    pub async fn discard_dead_letter(&self, sequence: u64) -> Result<(), EngineError> {
        if self.outbox.discard(sequence).await? {
            Ok(())
        } else {
            Err(EngineError::NoDeadLetter(sequence))
        }
    }

    /// Drops confirmed tombstones older than the grace period.
    pub async fn purge_tombstones(&self) -> Result<u64, EngineError> {
        Ok(self
            .local
            .purge_tombstones_older_than(self.settings.tombstone_grace)
            .await?)
    }

    /// Forgets pull watermarks so the next reconciliation re-reads
    /// everything for one collection, or all of them.
    pub async fn resync_from_scratch(
        &self,
        owner: &str,
        collection: Option<&str>,
    ) -> Result<(), EngineError> {
        match collection {
            Some(collection) => {
                validate_scope(collection, owner)?;
                self.cursors.reset(collection, owner).await?;
            }
            None => {
                if owner.trim().is_empty() {
                    return Err(ValidationError::EmptyOwner.into());
                }
                self.cursors.reset_owner(owner).await?;
            }
        }
        Ok(())
    }

    pub async fn status(&self, owner: &str) -> Result<SyncStatus, EngineError> {
        let state = self.monitor.state();
        Ok(SyncStatus {
            online: state.online,
            last_transition_at: state.last_transition_at,
            pending: self.outbox.pending_for_owner(owner).await?.len(),
            dead_letters: self.outbox.dead_for_owner(owner).await?,
            cursors: self.cursors.list_for_owner(owner).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use lifesync_core::{MemoryRemote, Operation, WriteOp};
    use serde_json::json;

    struct TestContext {
        _dir: tempfile::TempDir,
        pool: SqlitePool,
        remote: Arc<MemoryRemote>,
        engine: SyncEngine,
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn fast_settings() -> EngineSettings {
        EngineSettings {
            call_timeout: Duration::from_millis(500),
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            dead_letter_after: 2,
            tombstone_grace: chrono::Duration::zero(),
            coalesce_updates: true,
        }
    }

    async fn setup_with(online: bool, settings: EngineSettings) -> TestContext {
        let (dir, pool) = test_pool().await;
        let remote = Arc::new(MemoryRemote::new());
        remote.set_online(online);
        let monitor = Arc::new(ConnectivityMonitor::new(remote.clone(), Duration::from_millis(500)));
        monitor.probe().await;
        let engine = SyncEngine::open(pool.clone(), remote.clone(), monitor, settings)
            .await
            .unwrap();
        TestContext {
            _dir: dir,
            pool,
            remote,
            engine,
        }
    }

    async fn setup(online: bool) -> TestContext {
        setup_with(online, fast_settings()).await
    }

    async fn go_online(ctx: &TestContext) {
        ctx.remote.set_online(true);
        assert!(ctx.engine.monitor().probe().await);
    }

    async fn go_offline(ctx: &TestContext) {
        ctx.remote.set_online(false);
        assert!(!ctx.engine.monitor().probe().await);
    }

    async fn local(ctx: &TestContext, id: &str) -> Option<Record> {
        ctx.engine.local.get("tasks", "u1", id).await.unwrap()
    }

    #[tokio::test]
    async fn test_offline_insert_then_reconcile_scenario() {
        let ctx = setup(false).await;

        let record = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"title": "Buy milk"})))
            .await
            .unwrap();

        let fetched = ctx.engine.fetch("tasks", "u1", None).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, record.id);
        assert_eq!(fetched[0].payload["title"], json!("Buy milk"));
        assert_eq!(ctx.engine.pending_writes("u1").await.unwrap().len(), 1);

        go_online(&ctx).await;
        let report = ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        assert_eq!(report.pushed(), 1);
        assert!(report.is_complete());
        assert!(ctx.engine.pending_writes("u1").await.unwrap().is_empty());

        let remote = ctx.remote.get("tasks", "u1", &record.id).unwrap();
        assert_eq!(remote.payload["title"], json!("Buy milk"));

        let after = ctx.engine.fetch("tasks", "u1", None).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, record.id);
        assert_eq!(after[0].payload["title"], json!("Buy milk"));
    }

    #[tokio::test]
    async fn test_online_delete_then_purge_scenario() {
        let ctx = setup(true).await;

        let record = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"title": "Buy milk"})))
            .await
            .unwrap();
        assert!(ctx.remote.get("tasks", "u1", &record.id).is_some());

        ctx.engine.delete("tasks", "u1", &record.id).await.unwrap();
        assert!(ctx.remote.get("tasks", "u1", &record.id).unwrap().deleted);
        assert!(local(&ctx, &record.id).await.unwrap().deleted);
        assert!(ctx.engine.pending_writes("u1").await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(ctx.engine.purge_tombstones().await.unwrap(), 1);
        ctx.remote.purge_tombstones_older_than(chrono::Duration::zero());

        assert!(local(&ctx, &record.id).await.is_none());
        assert!(ctx.remote.get("tasks", "u1", &record.id).is_none());
    }

    #[tokio::test]
    async fn test_online_writes_go_straight_to_remote() {
        let ctx = setup(true).await;

        let record = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"title": "a"})))
            .await
            .unwrap();
        ctx.engine
            .update("tasks", "u1", &record.id, payload(json!({"done": true})))
            .await
            .unwrap();

        assert!(ctx.engine.pending_writes("u1").await.unwrap().is_empty());
        let remote = ctx.remote.get("tasks", "u1", &record.id).unwrap();
        assert_eq!(remote.payload["done"], json!(true));
        assert_eq!(remote.updated_at, local(&ctx, &record.id).await.unwrap().updated_at);
    }

    #[tokio::test]
    async fn test_ordering_of_offline_insert_and_updates() {
        let settings = EngineSettings {
            coalesce_updates: false,
            ..fast_settings()
        };
        let ctx = setup_with(false, settings).await;

        let record = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"title": "a"})))
            .await
            .unwrap();
        ctx.engine
            .update("tasks", "u1", &record.id, payload(json!({"title": "b"})))
            .await
            .unwrap();
        ctx.engine
            .update("tasks", "u1", &record.id, payload(json!({"title": "c"})))
            .await
            .unwrap();

        go_online(&ctx).await;
        ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();

        let ops: Vec<Operation> = ctx.remote.writes().iter().map(WriteOp::operation).collect();
        assert_eq!(ops, vec![Operation::Insert, Operation::Update, Operation::Update]);
        assert_eq!(
            ctx.remote.get("tasks", "u1", &record.id).unwrap().payload["title"],
            json!("c")
        );
    }

    #[tokio::test]
    async fn test_offline_updates_coalesce() {
        let ctx = setup(false).await;

        let record = Record::new("tasks", "u1", payload(json!({"title": "a"}))).with_id("t1");
        ctx.remote.seed(record.clone());
        ctx.engine.local.put(&record).await.unwrap();

        ctx.engine
            .update("tasks", "u1", "t1", payload(json!({"title": "b"})))
            .await
            .unwrap();
        ctx.engine
            .update("tasks", "u1", "t1", payload(json!({"done": true})))
            .await
            .unwrap();

        let pending = ctx.engine.pending_writes("u1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, Operation::Update);
        assert_eq!(
            pending[0].payload,
            Some(payload(json!({"title": "b", "done": true})))
        );
    }

    #[tokio::test]
    async fn test_offline_writes_converge_after_reconcile() {
        let ctx = setup(false).await;

        let a = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"title": "a"})))
            .await
            .unwrap();
        let b = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"title": "b"})))
            .await
            .unwrap();
        let note = ctx
            .engine
            .insert("notes", "u1", payload(json!({"title": "n"})))
            .await
            .unwrap();
        ctx.engine
            .update("tasks", "u1", &a.id, payload(json!({"done": true})))
            .await
            .unwrap();
        ctx.engine.delete("tasks", "u1", &b.id).await.unwrap();

        go_online(&ctx).await;
        let report = ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        assert!(report.is_complete());

        for (collection, id) in [("tasks", &a.id), ("notes", &note.id)] {
            let local = ctx.engine.local.get(collection, "u1", id).await.unwrap();
            let remote = ctx.remote.get(collection, "u1", id);
            assert!(local.is_some());
            assert_eq!(local, remote, "{}/{} diverged", collection, id);
        }
        // The insert of `b` was cancelled by its delete and never sent.
        assert!(local(&ctx, &b.id).await.unwrap().deleted);
        assert!(ctx.remote.get("tasks", "u1", &b.id).is_none());
        assert_eq!(
            ctx.engine.fetch("tasks", "u1", None).await.unwrap(),
            ctx.remote.live_records("tasks", "u1")
        );
    }

    #[tokio::test]
    async fn test_optimistic_visibility_online_with_backlog() {
        let ctx = setup(false).await;

        let queued = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"title": "queued"})))
            .await
            .unwrap();

        // Back online but not reconciled yet: the remote does not have it.
        go_online(&ctx).await;
        ctx.remote.seed(Record::new("tasks", "u1", payload(json!({"title": "remote"}))));

        let fetched = ctx.engine.fetch("tasks", "u1", None).await.unwrap();
        let titles: Vec<&serde_json::Value> = fetched.iter().map(|r| &r.payload["title"]).collect();
        assert_eq!(fetched.len(), 2);
        assert!(titles.contains(&&json!("queued")));
        assert!(fetched.iter().any(|r| r.id == queued.id));

        // Writes behind a backlog are queued, not sent ahead of it.
        ctx.engine
            .update("tasks", "u1", &queued.id, payload(json!({"done": true})))
            .await
            .unwrap();
        assert!(ctx.remote.writes().is_empty());
    }

    #[tokio::test]
    async fn test_local_delete_hides_remote_copy_until_synced() {
        let ctx = setup(true).await;
        let record = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"title": "a"})))
            .await
            .unwrap();

        go_offline(&ctx).await;
        ctx.engine.delete("tasks", "u1", &record.id).await.unwrap();
        go_online(&ctx).await;

        let fetched = ctx.engine.fetch("tasks", "u1", None).await.unwrap();
        assert!(fetched.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_falls_back_when_remote_fails() {
        let ctx = setup(true).await;
        ctx.engine
            .insert("tasks", "u1", payload(json!({"title": "a"})))
            .await
            .unwrap();

        ctx.remote.fail_next(1);
        let fetched = ctx.engine.fetch("tasks", "u1", None).await.unwrap();
        assert_eq!(fetched.len(), 1);
        // A failed call does not flip connectivity.
        assert!(ctx.engine.connection_status());
    }

    #[tokio::test]
    async fn test_timeout_is_treated_as_offline_for_the_call() {
        let ctx = setup(true).await;
        ctx.remote.set_latency(Some(Duration::from_secs(2)));

        let record = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"title": "slow"})))
            .await
            .unwrap();

        let pending = ctx.engine.pending_writes("u1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].last_error.as_deref().unwrap().contains("timed out"));
        assert!(local(&ctx, &record.id).await.is_some());
    }

    #[tokio::test]
    async fn test_invalid_input_touches_nothing() {
        let ctx = setup(true).await;

        let err = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"done": false})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Invalid(_)));

        let err = ctx
            .engine
            .insert("Bad Name", "u1", payload(json!({"title": "a"})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Invalid(_)));

        let err = ctx
            .engine
            .update("tasks", "u1", "missing", payload(json!({"done": true})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        assert!(ctx.engine.pending_writes("u1").await.unwrap().is_empty());
        assert!(ctx.remote.writes().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_write_is_dead_lettered() {
        let ctx = setup(false).await;
        let record = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"title": "a"})))
            .await
            .unwrap();
        let good = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"title": "b"})))
            .await
            .unwrap();
        ctx.remote.reject_writes_for(&record.id);
        go_online(&ctx).await;

        let first = ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        assert!(first.dead_lettered().is_empty());
        // Later writes are not held back by a rejected one.
        assert!(ctx.remote.get("tasks", "u1", &good.id).is_some());

        let second = ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        assert_eq!(second.dead_lettered().len(), 1);

        let status = ctx.engine.status("u1").await.unwrap();
        assert_eq!(status.pending, 0);
        assert_eq!(status.dead_letters.len(), 1);
        let sequence = status.dead_letters[0].sequence;

        ctx.engine.retry_dead_letter(sequence).await.unwrap();
        assert_eq!(ctx.engine.pending_writes("u1").await.unwrap().len(), 1);
        assert!(matches!(
            ctx.engine.discard_dead_letter(sequence).await,
            Err(EngineError::NoDeadLetter(_))
        ));
    }

    #[tokio::test]
    async fn test_transient_failure_stops_drain_in_order() {
        let ctx = setup(false).await;
        let a = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"title": "a"})))
            .await
            .unwrap();
        ctx.engine
            .insert("tasks", "u1", payload(json!({"title": "b"})))
            .await
            .unwrap();
        go_online(&ctx).await;

        // Every call fails, including the pulls of other collections.
        ctx.remote.fail_next(1000);
        let report = ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        let tasks = report
            .collections
            .iter()
            .find(|c| c.collection == "tasks")
            .unwrap();
        assert!(tasks.stalled);
        assert_eq!(tasks.pushed, 0);
        assert!(ctx.remote.writes().is_empty());
        assert_eq!(ctx.engine.pending_writes("u1").await.unwrap().len(), 2);

        ctx.remote.fail_next(0);
        let report = ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        assert!(report.is_complete());
        let writes = ctx.remote.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].id(), a.id);
    }

    #[tokio::test]
    async fn test_cancelled_reconcile_leaves_outbox() {
        let ctx = setup(false).await;
        ctx.engine
            .insert("tasks", "u1", payload(json!({"title": "a"})))
            .await
            .unwrap();
        go_online(&ctx).await;

        let cancel = CancelFlag::new();
        cancel.cancel();
        let report = ctx.engine.reconcile_all("u1", &cancel).await.unwrap();
        assert!(report.collections.iter().all(|c| c.cancelled));
        assert!(!report.is_complete());
        assert_eq!(ctx.engine.pending_writes("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pull_merges_remote_changes_and_advances_cursor() {
        let ctx = setup(true).await;
        let remote_record = Record::new("habits", "u1", payload(json!({"name": "Read"})));
        ctx.remote.seed(remote_record.clone());

        let report = ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        assert_eq!(report.pulled(), 1);
        assert_eq!(
            ctx.engine.local.get("habits", "u1", &remote_record.id).await.unwrap(),
            Some(remote_record.clone())
        );

        // Nothing new the second time.
        let report = ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        assert_eq!(report.pulled(), 0);

        let status = ctx.engine.status("u1").await.unwrap();
        assert!(status.cursors.iter().any(|c| c.collection == "habits"));

        // A remote tombstone newer than the local copy wins.
        let tombstone = Record::tombstone("habits", "u1", &remote_record.id, lifesync_core::models::now());
        ctx.remote.seed(tombstone);
        ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        assert!(ctx
            .engine
            .local
            .get("habits", "u1", &remote_record.id)
            .await
            .unwrap()
            .unwrap()
            .deleted);
    }

    #[tokio::test]
    async fn test_corrupt_row_triggers_full_repull() {
        let ctx = setup(true).await;
        let record = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"title": "a"})))
            .await
            .unwrap();
        ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        assert!(ctx.engine.cursors.get("tasks", "u1").await.unwrap().is_some());

        sqlx::query("UPDATE records_tasks SET payload = '{' WHERE id = ?")
            .bind(&record.id)
            .execute(&ctx.pool)
            .await
            .unwrap();

        go_offline(&ctx).await;
        assert!(ctx.engine.fetch("tasks", "u1", None).await.unwrap().is_empty());
        assert!(ctx.engine.cursors.get("tasks", "u1").await.unwrap().is_none());

        go_online(&ctx).await;
        ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        assert_eq!(local(&ctx, &record.id).await.unwrap().payload["title"], json!("a"));
    }

    #[tokio::test]
    async fn test_resync_from_scratch_resets_cursors() {
        let ctx = setup(true).await;
        ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        assert!(!ctx.engine.status("u1").await.unwrap().cursors.is_empty());

        ctx.engine.resync_from_scratch("u1", Some("tasks")).await.unwrap();
        assert!(ctx.engine.cursors.get("tasks", "u1").await.unwrap().is_none());
        assert!(ctx.engine.cursors.get("notes", "u1").await.unwrap().is_some());

        ctx.engine.resync_from_scratch("u1", None).await.unwrap();
        assert!(ctx.engine.status("u1").await.unwrap().cursors.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_offline_reports_offline() {
        let ctx = setup(false).await;
        let report = ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        assert!(report.offline);
        assert!(report.collections.is_empty());
    }

    fn tasks_report(report: &ReconcileReport) -> &CollectionReport {
        report
            .collections
            .iter()
            .find(|c| c.collection == "tasks")
            .unwrap()
    }

    fn attempts_for(ctx: &TestContext, id: &str) -> Vec<Operation> {
        ctx.remote
            .attempted_writes()
            .iter()
            .filter(|op| op.id() == id)
            .map(|op| op.operation())
            .collect()
    }

    #[tokio::test]
    async fn test_rejected_insert_holds_later_writes_for_same_record() {
        let settings = EngineSettings {
            coalesce_updates: false,
            ..fast_settings()
        };
        let ctx = setup_with(false, settings).await;
        let record = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"title": "a"})))
            .await
            .unwrap();
        ctx.engine
            .update("tasks", "u1", &record.id, payload(json!({"done": true})))
            .await
            .unwrap();
        let other = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"title": "b"})))
            .await
            .unwrap();
        ctx.remote.reject_writes_for(&record.id);
        go_online(&ctx).await;

        let report = ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        let tasks = tasks_report(&report);
        assert_eq!(tasks.rejected, 1);
        assert_eq!(tasks.held, 1);
        assert_eq!(tasks.pushed, 1);
        assert_eq!(report.held(), 1);
        assert_eq!(attempts_for(&ctx, &record.id), vec![Operation::Insert]);
        assert!(ctx.remote.get("tasks", "u1", &other.id).is_some());
        assert_eq!(ctx.engine.pending_writes("u1").await.unwrap().len(), 2);

        ctx.remote.allow_writes_for(&record.id);
        let report = ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        assert_eq!(tasks_report(&report).held, 0);
        let applied: Vec<Operation> = ctx
            .remote
            .writes()
            .iter()
            .filter(|op| op.id() == record.id)
            .map(|op| op.operation())
            .collect();
        assert_eq!(applied, vec![Operation::Insert, Operation::Update]);
        assert_eq!(
            ctx.remote.get("tasks", "u1", &record.id).unwrap().payload["done"],
            json!(true)
        );
        assert!(ctx.engine.pending_writes("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dead_lettered_insert_holds_later_writes_until_retried() {
        let settings = EngineSettings {
            coalesce_updates: false,
            ..fast_settings()
        };
        let ctx = setup_with(false, settings).await;
        let record = ctx
            .engine
            .insert("tasks", "u1", payload(json!({"title": "a"})))
            .await
            .unwrap();
        ctx.engine
            .update("tasks", "u1", &record.id, payload(json!({"done": true})))
            .await
            .unwrap();
        ctx.remote.reject_writes_for(&record.id);
        go_online(&ctx).await;

        ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        let report = ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        assert_eq!(report.dead_lettered().len(), 1);
        assert_eq!(tasks_report(&report).held, 1);

        // Nothing is sent for the record while its insert sits dead.
        let report = ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        assert_eq!(tasks_report(&report).held, 1);
        assert_eq!(
            attempts_for(&ctx, &record.id),
            vec![Operation::Insert, Operation::Insert]
        );

        // Direct writes for that record queue up instead of going out.
        ctx.engine
            .update("tasks", "u1", &record.id, payload(json!({"title": "c"})))
            .await
            .unwrap();
        assert_eq!(attempts_for(&ctx, &record.id).len(), 2);

        ctx.remote.allow_writes_for(&record.id);
        let sequence = ctx.engine.dead_letters("u1").await.unwrap()[0].sequence;
        ctx.engine.retry_dead_letter(sequence).await.unwrap();
        let report = ctx.engine.reconcile_all("u1", &CancelFlag::new()).await.unwrap();
        assert_eq!(tasks_report(&report).pushed, 3);
        let remote = ctx.remote.get("tasks", "u1", &record.id).unwrap();
        assert_eq!(remote.payload["done"], json!(true));
        assert_eq!(remote.payload["title"], json!("c"));
    }

    #[tokio::test]
    async fn test_owners_with_pending_writes() {
        let ctx = setup(false).await;
        assert!(ctx.engine.owners_with_pending_writes().await.unwrap().is_empty());
        ctx.engine
            .insert("notes", "u2", payload(json!({"title": "x"})))
            .await
            .unwrap();
        assert_eq!(ctx.engine.owners_with_pending_writes().await.unwrap(), vec!["u2"]);

        go_online(&ctx).await;
        ctx.engine.reconcile_all("u2", &CancelFlag::new()).await.unwrap();
        assert!(ctx.engine.owners_with_pending_writes().await.unwrap().is_empty());
    }

    /// Backend that assigns its own ids to inserts.
    struct RenamingRemote(MemoryRemote);

    #[async_trait::async_trait]
    impl RemoteClient for RenamingRemote {
        async fn query(
            &self,
            collection: &str,
            owner: &str,
            query: &RemoteQuery,
        ) -> Result<lifesync_core::QueryResponse, RemoteError> {
            self.0.query(collection, owner, query).await
        }

        async fn write(
            &self,
            collection: &str,
            owner: &str,
            op: &WriteOp,
        ) -> Result<Record, RemoteError> {
            let op = match op {
                WriteOp::Insert {
                    id,
                    payload,
                    updated_at,
                } => WriteOp::Insert {
                    id: format!("srv-{}", id),
                    payload: payload.clone(),
                    updated_at: *updated_at,
                },
                other => other.clone(),
            };
            self.0.write(collection, owner, &op).await
        }

        async fn ping(&self) -> Result<(), RemoteError> {
            self.0.ping().await
        }
    }

    #[tokio::test]
    async fn test_remote_assigned_id_is_adopted() {
        let (_dir, pool) = test_pool().await;
        let remote = Arc::new(RenamingRemote(MemoryRemote::new()));
        let monitor = Arc::new(ConnectivityMonitor::new(remote.clone(), Duration::from_millis(500)));
        monitor.probe().await;
        let engine = SyncEngine::open(pool, remote.clone(), monitor, fast_settings())
            .await
            .unwrap();

        let record = engine
            .insert("tasks", "u1", payload(json!({"title": "a"})))
            .await
            .unwrap();
        let local_id = record.id.strip_prefix("srv-").unwrap();
        assert_eq!(record.payload["title"], json!("a"));

        assert!(engine.local.get("tasks", "u1", local_id).await.unwrap().is_none());
        let adopted = engine.local.get("tasks", "u1", &record.id).await.unwrap().unwrap();
        assert_eq!(adopted, record);

        engine
            .update("tasks", "u1", &record.id, payload(json!({"done": true})))
            .await
            .unwrap();
        assert_eq!(
            remote.0.get("tasks", "u1", &record.id).unwrap().payload["done"],
            json!(true)
        );
    }
}
