//! Reachability of the remote.
//!
//! The monitor owns the process-wide [`ConnectivityState`]. Subscribers get
//! a `watch` receiver that only changes on transitions.

use std::sync::Arc;
use std::time::Duration;

use lifesync_core::models::now;
use lifesync_core::{ConnectivityState, RemoteClient};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::retry::with_timeout;

pub struct ConnectivityMonitor {
    remote: Arc<dyn RemoteClient>,
    state: watch::Sender<ConnectivityState>,
    probe_timeout: Duration,
}

impl ConnectivityMonitor {
    /// Starts out offline until the first successful probe.
    pub fn new(remote: Arc<dyn RemoteClient>, probe_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ConnectivityState::offline());
        Self {
            remote,
            state,
            probe_timeout,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().online
    }

    /// Records reachability. Returns true if this was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.online == online {
                return false;
            }
            state.online = online;
            state.last_transition_at = now();
            true
        });
        if changed {
            if online {
                tracing::info!("Remote is reachable");
            } else {
                tracing::info!("Remote is unreachable, working offline");
            }
        }
        changed
    }

    /// Pings the remote once and records the result.
    pub async fn probe(&self) -> bool {
        let reachable = match with_timeout(self.probe_timeout, self.remote.ping()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Probe failed: {}", e);
                false
            }
        };
        self.set_online(reachable);
        reachable
    }

    /// Probes on a fixed interval until the returned task is aborted.
    pub fn spawn_probe_loop(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.probe().await;
            }
        })
    }
}
