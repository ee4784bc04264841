//! Background worker deciding when reconciliation runs.
//!
//! Triggers are "sync now", app foreground, and the remote becoming
//! reachable again. At most one reconciliation per owner runs at a time; a
//! trigger that arrives while one is running is coalesced into it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};

use super::engine::{ReconcileReport, SyncEngine};
use super::retry::CancelFlag;
use lifesync_core::ConnectivityState;

#[derive(Error, Debug, PartialEq)]
pub enum SchedulerError {
    #[error("Sync worker has stopped")]
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(ReconcileReport),
    /// A reconciliation for the owner was already running.
    Coalesced,
    Failed(String),
}

enum SchedulerCommand {
    SyncNow {
        owner: String,
        reply: oneshot::Sender<SyncOutcome>,
    },
    Foreground {
        owner: String,
    },
    Background,
    Shutdown,
}

type Running = Arc<Mutex<HashMap<String, CancelFlag>>>;

pub struct SyncScheduler {
    sender: mpsc::Sender<SchedulerCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn start(engine: Arc<SyncEngine>) -> Self {
        let (sender, receiver) = mpsc::channel(64);
        let connectivity = engine.monitor().subscribe();
        let worker = tokio::spawn(Worker::new(engine).run(receiver, connectivity));

        Self {
            sender,
            worker: Mutex::new(Some(worker)),
        }
    }

    async fn send(&self, command: SchedulerCommand) -> Result<(), SchedulerError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| SchedulerError::Stopped)
    }

    /// Reconciles `owner` and waits for the result.
    pub async fn sync_now(&self, owner: &str) -> Result<SyncOutcome, SchedulerError> {
        let (reply, outcome) = oneshot::channel();
        self.send(SchedulerCommand::SyncNow {
            owner: owner.to_string(),
            reply,
        })
        .await?;
        outcome.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Starts a reconciliation for `owner` without waiting for it.
    pub async fn app_foreground(&self, owner: &str) -> Result<(), SchedulerError> {
        self.send(SchedulerCommand::Foreground {
            owner: owner.to_string(),
        })
        .await
    }

    /// Asks running reconciliations to stop after their current write.
    pub async fn app_background(&self) -> Result<(), SchedulerError> {
        self.send(SchedulerCommand::Background).await
    }

    /// Cancels running work, waits for it to wind down and stops the worker.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send(SchedulerCommand::Shutdown).await?;
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!("Sync worker panicked: {}", e);
            }
        }
        Ok(())
    }
}

struct Worker {
    engine: Arc<SyncEngine>,
    running: Running,
    /// Owners seen so far; reconciled on reconnect along with every owner
    /// that has writes waiting in the outbox.
    owners: HashSet<String>,
    tasks: JoinSet<()>,
}

impl Worker {
    fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            running: Arc::new(Mutex::new(HashMap::new())),
            owners: HashSet::new(),
            tasks: JoinSet::new(),
        }
    }

    async fn run(
        mut self,
        mut receiver: mpsc::Receiver<SchedulerCommand>,
        mut connectivity: watch::Receiver<ConnectivityState>,
    ) {
        let mut was_online = connectivity.borrow_and_update().online;
        let mut watching = true;

        loop {
            tokio::select! {
                command = receiver.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        SchedulerCommand::SyncNow { owner, reply } => self.trigger(owner, Some(reply)),
                        SchedulerCommand::Foreground { owner } => self.trigger(owner, None),
                        SchedulerCommand::Background => self.cancel_all(),
                        SchedulerCommand::Shutdown => break,
                    }
                }
                changed = connectivity.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let online = connectivity.borrow_and_update().online;
                    if online && !was_online {
                        self.reconcile_known_owners().await;
                    }
                    was_online = online;
                }
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}
            }
        }

        self.cancel_all();
        receiver.close();
        while self.tasks.join_next().await.is_some() {}
        tracing::info!("Sync worker stopped");
    }

    async fn reconcile_known_owners(&mut self) {
        match self.engine.owners_with_pending_writes().await {
            Ok(pending) => self.owners.extend(pending),
            Err(e) => tracing::error!("Failed to list owners with pending writes: {}", e),
        }
        tracing::info!(owners = self.owners.len(), "Back online, reconciling");
        let owners: Vec<String> = self.owners.iter().cloned().collect();
        for owner in owners {
            self.trigger(owner, None);
        }
    }

    fn cancel_all(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for cancel in running.values() {
            cancel.cancel();
        }
    }

    fn trigger(&mut self, owner: String, reply: Option<oneshot::Sender<SyncOutcome>>) {
        self.owners.insert(owner.clone());

        let cancel = {
            let mut running = self
                .running
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if running.contains_key(&owner) {
                tracing::debug!(%owner, "Reconciliation already running, coalescing");
                if let Some(reply) = reply {
                    let _ = reply.send(SyncOutcome::Coalesced);
                }
                return;
            }
            let cancel = CancelFlag::new();
            running.insert(owner.clone(), cancel.clone());
            cancel
        };

        let engine = self.engine.clone();
        let running = self.running.clone();
        self.tasks.spawn(async move {
            let outcome = reconcile(&engine, &owner, &cancel).await;
            // Leave the running set before replying so a follow-up trigger
            // from the same caller is not coalesced into this one.
            running
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&owner);
            if let Some(reply) = reply {
                let _ = reply.send(outcome);
            }
        });
    }
}

async fn reconcile(engine: &SyncEngine, owner: &str, cancel: &CancelFlag) -> SyncOutcome {
    let report = match engine.reconcile_all(owner, cancel).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(owner, "Reconciliation failed: {}", e);
            return SyncOutcome::Failed(e.to_string());
        }
    };

    if !report.offline {
        match engine.purge_tombstones().await {
            Ok(0) => {}
            Ok(purged) => tracing::debug!(purged, "Purged confirmed tombstones"),
            Err(e) => tracing::warn!("Tombstone purge failed: {}", e),
        }
    }
    SyncOutcome::Completed(report)
}
