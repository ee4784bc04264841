//! In-process backend with the server's write semantics.
//!
//! Used as the remote in tests and offline demos. It can be switched offline,
//! made to fail or reject specific writes, and records every write it
//! applied so ordering can be checked.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::apply::apply_write;
use super::client::RemoteClient;
use super::error::RemoteError;
use super::protocol::{QueryResponse, RemoteQuery, WriteOp};
use crate::filter::apply_filter;
use crate::models::{next_timestamp, now, Record};

type Key = (String, String, String);

struct Stored {
    record: Record,
    received_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    records: HashMap<Key, Stored>,
    /// Every applied write, in arrival order.
    writes: Vec<(String, String, WriteOp)>,
    /// Every write that reached the backend, refused or not.
    attempts: Vec<WriteOp>,
    /// Ids whose writes are refused with 422.
    rejected_ids: HashSet<String>,
    /// Number of upcoming calls that fail as if the network dropped.
    failures_left: usize,
    clock: Option<DateTime<Utc>>,
    latency: Option<Duration>,
}

impl State {
    fn tick(&mut self) -> DateTime<Utc> {
        let ts = match self.clock {
            Some(last) => next_timestamp(last),
            None => now(),
        };
        self.clock = Some(ts);
        ts
    }

    fn take_failure(&mut self) -> bool {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            true
        } else {
            false
        }
    }
}

pub struct MemoryRemote {
    state: Mutex<State>,
    online: AtomicBool,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            online: AtomicBool::new(true),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Refuses every write for `id` with a validation-style rejection.
    pub fn reject_writes_for(&self, id: &str) {
        self.state().rejected_ids.insert(id.to_string());
    }

    /// Lifts a rejection set by [`Self::reject_writes_for`].
    pub fn allow_writes_for(&self, id: &str) {
        self.state().rejected_ids.remove(id);
    }

    /// Makes the next `count` calls fail with a transport error.
    pub fn fail_next(&self, count: usize) {
        self.state().failures_left = count;
    }

    /// Delays every call, to exercise caller timeouts.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// Stores a record as if another device had written it.
    pub fn seed(&self, record: Record) {
        let mut state = self.state();
        let received_at = state.tick();
        let key = (
            record.collection.clone(),
            record.owner.clone(),
            record.id.clone(),
        );
        state.records.insert(
            key,
            Stored {
                record,
                received_at,
            },
        );
    }

    pub fn get(&self, collection: &str, owner: &str, id: &str) -> Option<Record> {
        let key = (collection.to_string(), owner.to_string(), id.to_string());
        self.state().records.get(&key).map(|s| s.record.clone())
    }

    /// Live records of a collection for an owner, in default order.
    pub fn live_records(&self, collection: &str, owner: &str) -> Vec<Record> {
        let records = self
            .state()
            .records
            .values()
            .filter(|s| {
                s.record.collection == collection && s.record.owner == owner && !s.record.deleted
            })
            .map(|s| s.record.clone())
            .collect();
        apply_filter(None, records)
    }

    /// Writes applied so far, in arrival order.
    pub fn writes(&self) -> Vec<WriteOp> {
        self.state().writes.iter().map(|(_, _, op)| op.clone()).collect()
    }

    /// Writes that got past the network, including refused ones.
    pub fn attempted_writes(&self) -> Vec<WriteOp> {
        self.state().attempts.clone()
    }

    /// Drops tombstones whose deletion is older than `grace`.
    pub fn purge_tombstones_older_than(&self, grace: chrono::Duration) -> usize {
        let cutoff = now() - grace;
        let mut state = self.state();
        let before = state.records.len();
        state
            .records
            .retain(|_, s| !(s.record.deleted && s.record.updated_at <= cutoff));
        before - state.records.len()
    }

    async fn simulate_network(&self) -> Result<(), RemoteError> {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.is_online() {
            return Err(RemoteError::Unreachable("memory remote is offline".into()));
        }
        if self.state().take_failure() {
            return Err(RemoteError::Unreachable("simulated connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn query(
        &self,
        collection: &str,
        owner: &str,
        query: &RemoteQuery,
    ) -> Result<QueryResponse, RemoteError> {
        self.simulate_network().await?;

        let mut state = self.state();
        let synced_at = state.tick();
        let records: Vec<Record> = state
            .records
            .values()
            .filter(|s| s.record.collection == collection && s.record.owner == owner)
            .filter(|s| query.include_deleted || !s.record.deleted)
            .filter(|s| query.since.map_or(true, |since| s.received_at > since))
            .map(|s| s.record.clone())
            .collect();

        Ok(QueryResponse {
            records: apply_filter(query.filter.as_ref(), records),
            synced_at,
        })
    }

    async fn write(
        &self,
        collection: &str,
        owner: &str,
        op: &WriteOp,
    ) -> Result<Record, RemoteError> {
        self.simulate_network().await?;

        let mut state = self.state();
        state.attempts.push(op.clone());
        if state.rejected_ids.contains(op.id()) {
            return Err(RemoteError::Rejected {
                status: 422,
                message: format!("write for {} refused", op.id()),
            });
        }

        let key = (collection.to_string(), owner.to_string(), op.id().to_string());
        let existing = state.records.get(&key).map(|s| s.record.clone());
        let record = apply_write(collection, owner, existing, op).map_err(|e| {
            RemoteError::Rejected {
                status: e.status(),
                message: e.to_string(),
            }
        })?;

        let received_at = state.tick();
        state.records.insert(
            key,
            Stored {
                record: record.clone(),
                received_at,
            },
        );
        state
            .writes
            .push((collection.to_string(), owner.to_string(), op.clone()));
        Ok(record)
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.simulate_network().await
    }
}
