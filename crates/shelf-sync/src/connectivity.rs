// File: shelf-sync/src/connectivity.rs
// Purpose: Device connectivity and server reachability tracking

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::client::ResourceClient;

/// Snapshot of connectivity
///
/// `server_reachable` is never true while `online` is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
    /// Platform signal: the device has a network
    pub online: bool,
    /// Result of the last probe against the server
    pub server_reachable: bool,
}

impl ConnectivityState {
    /// Whether server calls should be attempted at all
    pub fn can_reach_server(&self) -> bool {
        self.online && self.server_reachable
    }
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self {
            online: true,
            server_reachable: false,
        }
    }
}

/// Publishes connectivity transitions
///
/// The monitor only observes: it never queues or replays anything. Consumers
/// subscribe and react to `server_reachable` going from false to true.
pub struct ConnectivityMonitor {
    client: Arc<dyn ResourceClient>,
    probe_timeout: Duration,
    state: watch::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
    pub fn new(client: Arc<dyn ResourceClient>, probe_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ConnectivityState::default());
        Self {
            client,
            probe_timeout,
            state,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Apply the platform online signal
    ///
    /// Going offline marks the server unreachable immediately. Coming back
    /// online probes right away.
    pub async fn set_online(&self, online: bool) -> ConnectivityState {
        if online {
            self.update(|state| state.online = true);
            self.probe().await;
        } else {
            self.update(|state| {
                state.online = false;
                state.server_reachable = false;
            });
        }
        self.state()
    }

    /// Probe the server and publish the result
    ///
    /// Skipped while offline. Errors, timeouts and non-success answers all
    /// read as unreachable.
    pub async fn probe(&self) -> bool {
        if !self.state().online {
            return false;
        }

        let reachable = tokio::time::timeout(self.probe_timeout, self.client.check_server())
            .await
            .unwrap_or_else(|_| {
                tracing::debug!("Server probe timed out after {:?}", self.probe_timeout);
                false
            });

        // The device may have gone offline while the probe was in flight
        self.update(|state| state.server_reachable = state.online && reachable);
        self.state().server_reachable
    }

    /// Mark the server unreachable after a failed call, without probing
    pub fn mark_unreachable(&self) {
        self.update(|state| state.server_reachable = false);
    }

    /// Probe periodically until the task is dropped
    pub async fn run(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.state().online {
                self.probe().await;
            }
        }
    }

    fn update(&self, apply: impl FnOnce(&mut ConnectivityState)) {
        self.state.send_if_modified(|state| {
            let before = *state;
            apply(state);
            if *state == before {
                return false;
            }
            tracing::info!(
                "Connectivity changed: online={} server_reachable={}",
                state.online,
                state.server_reachable
            );
            true
        });
    }
}
